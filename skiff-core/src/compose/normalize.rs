//! Normalizers for the polymorphic compose fields.
//!
//! Every function converts a raw `*Shape` into its canonical form eagerly and
//! returns a plain reason string on failure; the loader attaches file and
//! service context.

use super::types::*;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

type NormalizeResult<T> = std::result::Result<T, String>;

/// Normalize an environment block. Entries without a value resolve from the
/// lookup at parse time and are dropped when unset.
pub fn environment<F>(shape: &EnvironmentShape, lookup: &F) -> NormalizeResult<BTreeMap<String, String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = BTreeMap::new();
    match shape {
        EnvironmentShape::Map(map) => {
            for (name, value) in map {
                if name.is_empty() {
                    return Err("environment variable with empty name".to_string());
                }
                match value {
                    Some(v) => {
                        out.insert(name.clone(), v.render());
                    }
                    None => {
                        if let Some(v) = lookup(name) {
                            out.insert(name.clone(), v);
                        }
                    }
                }
            }
        }
        EnvironmentShape::List(entries) => {
            for entry in entries {
                let (name, value) = match entry.split_once('=') {
                    Some((name, value)) => (name, Some(value.to_string())),
                    None => (entry.as_str(), lookup(entry)),
                };
                if name.is_empty() {
                    return Err(format!("environment entry {entry:?} has an empty name"));
                }
                if let Some(value) = value {
                    out.insert(name.to_string(), value);
                }
            }
        }
    }
    Ok(out)
}

/// Normalize the `ports` list, expanding ranges.
pub fn ports(shapes: &[PortShape]) -> NormalizeResult<Vec<PortBinding>> {
    let mut out = Vec::new();
    for shape in shapes {
        match shape {
            PortShape::Num(n) => {
                out.push(PortBinding {
                    internal: port_number(*n)?,
                    external: None,
                    protocol: Protocol::Tcp,
                });
            }
            PortShape::Str(spec) => port_string(spec, &mut out)?,
            PortShape::Long(long) => {
                let external = match &long.published {
                    None => None,
                    Some(v) => Some(port_number_str(&v.render())?),
                };
                out.push(PortBinding {
                    internal: port_number(long.target)?,
                    external,
                    protocol: protocol(long.protocol.as_deref())?,
                });
            }
        }
    }
    Ok(out)
}

fn port_string(spec: &str, out: &mut Vec<PortBinding>) -> NormalizeResult<()> {
    let (spec, protocol) = match spec.split_once('/') {
        Some((spec, proto)) => (spec, self::protocol(Some(proto))?),
        None => (spec, Protocol::Tcp),
    };
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [container] => {
            let (start, end) = port_range(container)?;
            for internal in start..=end {
                out.push(PortBinding {
                    internal,
                    external: None,
                    protocol,
                });
            }
        }
        [host, container] => {
            let (hs, he) = port_range(host)?;
            let (cs, ce) = port_range(container)?;
            if he - hs != ce - cs {
                return Err(format!("port range {spec:?} has mismatched lengths"));
            }
            for (external, internal) in (hs..=he).zip(cs..=ce) {
                out.push(PortBinding {
                    internal,
                    external: Some(external),
                    protocol,
                });
            }
        }
        _ => return Err(format!("invalid port specification {spec:?}")),
    }
    Ok(())
}

fn port_range(s: &str) -> NormalizeResult<(u16, u16)> {
    match s.split_once('-') {
        Some((start, end)) => {
            let start = port_number_str(start)?;
            let end = port_number_str(end)?;
            if end < start {
                return Err(format!("invalid port range {s:?}"));
            }
            Ok((start, end))
        }
        None => {
            let port = port_number_str(s)?;
            Ok((port, port))
        }
    }
}

fn port_number_str(s: &str) -> NormalizeResult<u16> {
    s.parse::<i64>()
        .map_err(|_| format!("invalid port {s:?}"))
        .and_then(port_number)
}

fn port_number(n: i64) -> NormalizeResult<u16> {
    if (1..=65535).contains(&n) {
        Ok(n as u16)
    } else {
        Err(format!("port {n} out of range"))
    }
}

fn protocol(s: Option<&str>) -> NormalizeResult<Protocol> {
    match s {
        None => Ok(Protocol::Tcp),
        Some(p) => match p.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol {other:?}")),
        },
    }
}

/// Normalize the `volumes` list.
pub fn volumes(shapes: &[VolumeShape]) -> NormalizeResult<Vec<PathMapping>> {
    shapes
        .iter()
        .map(|shape| match shape {
            VolumeShape::Short(spec) => {
                let parts: Vec<&str> = spec.split(':').collect();
                match parts.as_slice() {
                    [container] if !container.is_empty() => Ok(PathMapping {
                        host_path: None,
                        container_path: container.to_string(),
                        mode: None,
                    }),
                    [host, container] => Ok(PathMapping {
                        host_path: Some(host.to_string()),
                        container_path: container.to_string(),
                        mode: None,
                    }),
                    [host, container, mode] => Ok(PathMapping {
                        host_path: Some(host.to_string()),
                        container_path: container.to_string(),
                        mode: Some(mode.to_string()),
                    }),
                    _ => Err(format!("invalid volume specification {spec:?}")),
                }
            }
            VolumeShape::Long(long) => Ok(PathMapping {
                host_path: long.source.clone(),
                container_path: long.target.clone(),
                mode: long.read_only.and_then(|ro| ro.then(|| "ro".to_string())),
            }),
        })
        .collect()
}

/// Normalize a healthcheck block into `(healthcheck, disabled)`.
pub fn healthcheck(shape: &HealthcheckShape) -> NormalizeResult<(Option<Healthcheck>, bool)> {
    if shape.disable == Some(true) {
        if shape.test.is_some()
            || shape.interval.is_some()
            || shape.timeout.is_some()
            || shape.retries.is_some()
            || shape.start_period.is_some()
        {
            return Err("healthcheck sets disable together with other fields".to_string());
        }
        return Ok((None, true));
    }

    let test = match &shape.test {
        None => return Ok((None, false)),
        Some(CommandShape::Shell(cmd)) => vec!["CMD-SHELL".to_string(), cmd.clone()],
        Some(CommandShape::Argv(argv)) => match argv.first().map(String::as_str) {
            Some("NONE") => return Ok((None, true)),
            Some("CMD") | Some("CMD-SHELL") => argv.clone(),
            Some(other) => return Err(format!("unknown healthcheck test kind {other:?}")),
            None => return Ok((None, false)),
        },
    };

    let retries = match shape.retries {
        None => 3,
        Some(r) if r >= 0 => r as u32,
        Some(r) => return Err(format!("healthcheck retries {r} is negative")),
    };

    Ok((
        Some(Healthcheck {
            test,
            interval: optional_duration(shape.interval.as_deref(), Duration::from_secs(30))?,
            timeout: optional_duration(shape.timeout.as_deref(), Duration::from_secs(30))?,
            retries,
            start_period: optional_duration(shape.start_period.as_deref(), Duration::ZERO)?,
        }),
        false,
    ))
}

fn optional_duration(s: Option<&str>, default: Duration) -> NormalizeResult<Duration> {
    match s {
        None => Ok(default),
        Some(s) => parse_duration(s),
    }
}

/// Parse a docker-style duration such as `"90s"` or `"1m30s"`.
pub fn parse_duration(s: &str) -> NormalizeResult<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration {s:?}"));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration {s:?}"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            "ms" => value / 1000.0,
            unit => return Err(format!("invalid duration unit {unit:?} in {s:?}")),
        };
        total += Duration::from_secs_f64(seconds);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Normalize `command`/`entrypoint`: strings are shell-split, lists taken
/// literally.
pub fn command(shape: &CommandShape) -> NormalizeResult<Vec<String>> {
    match shape {
        CommandShape::Argv(argv) => Ok(argv.clone()),
        CommandShape::Shell(s) => shell_split(s),
    }
}

/// Split a command string into words honoring single and double quotes.
pub fn shell_split(input: &str) -> NormalizeResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_word = true;
                let quote = c;
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\\') if quote == '"' => match chars.next() {
                            Some(e) => current.push(e),
                            None => return Err(format!("unterminated quote in {input:?}")),
                        },
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated quote in {input:?}")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(e) => current.push(e),
                    None => return Err(format!("trailing backslash in {input:?}")),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Normalize the `restart` policy. Unknown values fall back to unset.
pub fn restart(value: Option<&str>) -> RestartPolicy {
    match value {
        None => RestartPolicy::Unset,
        Some("no") => RestartPolicy::No,
        Some("always") => RestartPolicy::Always,
        Some("on-failure") => RestartPolicy::OnFailure,
        Some(other) => {
            warn!("ignoring unsupported restart policy {other:?}");
            RestartPolicy::Unset
        }
    }
}

/// Normalize `depends_on` into a name to condition map.
pub fn depends_on(shape: &DependsOnShape) -> NormalizeResult<BTreeMap<String, Healthiness>> {
    let mut out = BTreeMap::new();
    match shape {
        DependsOnShape::List(names) => {
            for name in names {
                out.insert(name.clone(), Healthiness::Started);
            }
        }
        DependsOnShape::Map(entries) => {
            for (name, entry) in entries {
                let condition = entry
                    .as_ref()
                    .and_then(|e| e.condition.as_deref())
                    .unwrap_or("service_started");
                let healthiness = match condition {
                    "service_started" => Healthiness::Started,
                    "service_healthy" => Healthiness::Healthy,
                    other => {
                        return Err(format!("unknown depends_on condition {other:?}"))
                    }
                };
                out.insert(name.clone(), healthiness);
            }
        }
    }
    Ok(out)
}

/// Normalize `extends` into its canonical form.
pub fn extends(shape: &ExtendsShape) -> Extends {
    match shape {
        ExtendsShape::Service(service) => Extends {
            file: None,
            service: service.clone(),
        },
        ExtendsShape::Full { file, service } => Extends {
            file: file.as_ref().map(Into::into),
            service: service.clone(),
        },
    }
}
