//! Resolving the numeric uid/gid a container should run as.
//!
//! A compose `user:` field or image user may name the account instead of
//! giving numbers; names are resolved against `/etc/passwd` and `/etc/group`
//! extracted from the image.

use super::ContainerEngine;
use crate::error::{Result, SkiffError};

/// A parsed `user[:group]` value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: Option<i64>,
    pub user: String,
    pub gid: Option<i64>,
    pub group: String,
}

impl UserInfo {
    /// Whether the image's account databases are still needed to produce
    /// numeric ids.
    pub fn needs_resolution(&self) -> bool {
        self.uid.is_none() || (!self.group.is_empty() && self.gid.is_none())
    }
}

/// Parse a `user[:group]` string. An empty user means the image default and
/// resolves to root.
pub fn parse_userinfo(value: &str) -> Result<UserInfo> {
    let (user, group) = match value.split_once(':') {
        Some((user, group)) => (user, group),
        None => (value, ""),
    };
    if user.is_empty() {
        return Ok(UserInfo {
            uid: Some(0),
            user: String::new(),
            gid: None,
            group: group.to_string(),
        });
    }
    Ok(UserInfo {
        uid: user.parse().ok(),
        user: user.to_string(),
        gid: group.parse().ok(),
        group: group.to_string(),
    })
}

/// Fill in missing numeric ids from the image's `/etc/passwd` and
/// `/etc/group`.
pub async fn resolve_from_image(
    engine: &dyn ContainerEngine,
    image_id: &str,
    info: &mut UserInfo,
) -> Result<()> {
    let missing = |what: &str, name: &str| SkiffError::InvalidUser {
        subject: format!("image {image_id:?}"),
        user: name.to_string(),
        reason: format!("{what} does not contain the account"),
    };

    if info.uid.is_none() {
        let passwd = engine
            .read_image_file(image_id, "/etc/passwd")
            .await?
            .ok_or_else(|| missing("/etc/passwd", &info.user))?;
        let entry = passwd_entry(&passwd, &info.user)
            .ok_or_else(|| missing("/etc/passwd", &info.user))?;
        info.uid = Some(entry.0);
        if info.group.is_empty() {
            info.gid = Some(entry.1);
        }
    }

    if !info.group.is_empty() && info.gid.is_none() {
        let group = engine
            .read_image_file(image_id, "/etc/group")
            .await?
            .ok_or_else(|| missing("/etc/group", &info.group))?;
        info.gid = Some(
            group_entry(&group, &info.group).ok_or_else(|| missing("/etc/group", &info.group))?,
        );
    }

    Ok(())
}

/// Find `(uid, gid)` for a user name in passwd format.
fn passwd_entry(contents: &str, user: &str) -> Option<(i64, i64)> {
    for line in contents.lines() {
        let mut fields = line.split(':');
        if fields.next() != Some(user) {
            continue;
        }
        let _password = fields.next()?;
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        return Some((uid, gid));
    }
    None
}

/// Find the gid for a group name in group format.
fn group_entry(contents: &str, group: &str) -> Option<i64> {
    for line in contents.lines() {
        let mut fields = line.split(':');
        if fields.next() != Some(group) {
            continue;
        }
        let _password = fields.next()?;
        return fields.next()?.parse().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric() {
        let info = parse_userinfo("1000:1000").unwrap();
        assert_eq!(info.uid, Some(1000));
        assert_eq!(info.gid, Some(1000));
        assert!(!info.needs_resolution());
    }

    #[test]
    fn test_parse_names_need_resolution() {
        let info = parse_userinfo("postgres").unwrap();
        assert_eq!(info.uid, None);
        assert_eq!(info.user, "postgres");
        assert!(info.needs_resolution());

        let info = parse_userinfo("1000:staff").unwrap();
        assert_eq!(info.uid, Some(1000));
        assert_eq!(info.gid, None);
        assert!(info.needs_resolution());
    }

    #[test]
    fn test_parse_empty_defaults_to_root() {
        let info = parse_userinfo("").unwrap();
        assert_eq!(info.uid, Some(0));
        assert!(!info.needs_resolution());
    }

    #[test]
    fn test_passwd_entry() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\npostgres:x:999:998::/var/lib/postgresql:/bin/sh\n";
        assert_eq!(passwd_entry(passwd, "postgres"), Some((999, 998)));
        assert_eq!(passwd_entry(passwd, "nobody"), None);
    }

    #[test]
    fn test_group_entry() {
        let group = "root:x:0:\nstaff:x:50:alice,bob\n";
        assert_eq!(group_entry(group, "staff"), Some(50));
        assert_eq!(group_entry(group, "wheel"), None);
    }
}
