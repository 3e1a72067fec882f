//! End-to-end scenarios for compose loading, extends resolution and the
//! service graph.

use skiff_core::compose::{Healthiness, Loader, PathMapping};
use skiff_core::{ClusterImageStorage, Config, SkiffError};
use std::io::Write;
use std::path::PathBuf;

fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

fn load(content: &str) -> Result<Config, SkiffError> {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "docker-compose.yml", content);
    let mut loader = Loader::with_env(|_| None);
    Config::from_loader(&mut loader, Some(&path))
}

#[test]
fn depends_on_chain_resolves() {
    let cfg = load(
        r#"
version: '2'
services:
  service1:
    image: img1
    depends_on:
      - service2
  service2:
    image: img2
    depends_on:
      service3:
        condition: service_healthy
  service3:
    image: img3
"#,
    )
    .unwrap();

    assert_eq!(cfg.services.len(), 3);
    let service1 = cfg.find_service("service1").unwrap();
    assert_eq!(
        service1.depends_on.get("service2"),
        Some(&Healthiness::Started)
    );
    let service2 = cfg.find_service("service2").unwrap();
    assert_eq!(
        service2.depends_on.get("service3"),
        Some(&Healthiness::Healthy)
    );
    let service3 = cfg.find_service("service3").unwrap();
    assert!(service3.depends_on.is_empty());
}

#[test]
fn depends_on_cycle_is_rejected() {
    let err = load(
        r#"
version: '2'
services:
  service1:
    image: img1
    depends_on:
      - service2
  service2:
    image: img2
    depends_on:
      - service1
"#,
    )
    .unwrap_err();
    assert!(matches!(err, SkiffError::CircularDependency { .. }));
}

#[test]
fn depends_on_unknown_target_is_rejected() {
    let err = load(
        r#"
version: '2'
services:
  service1:
    image: img1
    depends_on:
      - ghost
"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        SkiffError::MissingDependency { service, dependency }
            if service == "service1" && dependency == "ghost"
    ));
}

#[test]
fn extends_across_files() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir,
        "parent.yml",
        r#"
testservice:
  command: ["bash", "-c", "echo 'Hello World!'"]
  image: ubuntu:latest
  volumes:
    - "aa:bb:cc"
"#,
    );
    let child = write_file(
        &dir,
        "docker-compose.yml",
        r#"
service1:
  environment:
    KEY1: VALUE1
  extends:
    service: service2
service2:
  environment:
    KEY2: VALUE2
  extends:
    file: parent.yml
    service: testservice
"#,
    );

    let mut loader = Loader::with_env(|_| None);
    let cfg = Config::from_loader(&mut loader, Some(&child)).unwrap();
    let service1 = cfg.find_service("service1").unwrap();

    assert_eq!(
        service1.environment,
        [
            ("KEY1".to_string(), "VALUE1".to_string()),
            ("KEY2".to_string(), "VALUE2".to_string()),
        ]
        .into()
    );
    assert_eq!(
        service1.command.as_deref(),
        Some(&["bash".to_string(), "-c".to_string(), "echo 'Hello World!'".to_string()][..])
    );
    assert_eq!(service1.image.as_deref(), Some("ubuntu:latest"));
    assert_eq!(
        service1.volumes,
        vec![PathMapping {
            host_path: Some("aa".to_string()),
            container_path: "bb".to_string(),
            mode: Some("cc".to_string()),
        }]
    );
}

#[test]
fn extends_with_depends_on_is_rejected() {
    let err = load(
        r#"
version: '2'
services:
  service1:
    image: img1
    extends:
      service: service2
  service2:
    image: img2
    depends_on:
      - service1
"#,
    )
    .unwrap_err();
    assert!(matches!(err, SkiffError::ExtendsWithDependsOn { .. }));
}

#[test]
fn cluster_image_storage_and_push_images_are_mutually_exclusive() {
    let err = load(
        r#"
version: '2'
services:
  app:
    image: img
x-kube-compose:
  cluster_image_storage:
    type: docker
  push_images:
    docker_registry: registry.example.com
"#,
    )
    .unwrap_err();
    assert!(matches!(err, SkiffError::InvalidCompose { .. }));
}

#[test]
fn legacy_push_images_maps_to_registry_storage() {
    let cfg = load(
        r#"
version: '2'
x-kube-compose:
  push_images:
    docker_registry: 'my-docker-registry.example.com'
"#,
    )
    .unwrap();
    assert_eq!(
        cfg.cluster_image_storage,
        ClusterImageStorage::DockerRegistry {
            host: "my-docker-registry.example.com".to_string()
        }
    );
}

#[test]
fn cluster_image_storage_docker() {
    let cfg = load(
        r#"
version: '2.4'
x-kube-compose:
  cluster_image_storage:
    type: docker
"#,
    )
    .unwrap();
    assert_eq!(cfg.cluster_image_storage, ClusterImageStorage::Docker);
}

#[test]
fn cluster_image_storage_docker_registry() {
    let cfg = load(
        r#"
version: '2.4'
x-kube-compose:
  cluster_image_storage:
    type: docker_registry
    host: docker-registry-default.cluster.example.com
"#,
    )
    .unwrap();
    assert_eq!(
        cfg.cluster_image_storage,
        ClusterImageStorage::DockerRegistry {
            host: "docker-registry-default.cluster.example.com".to_string()
        }
    );
}

#[test]
fn cluster_image_storage_invalid_type() {
    let err = load(
        r#"
version: '2.4'
x-kube-compose:
  cluster_image_storage:
    type: invalid
"#,
    )
    .unwrap_err();
    assert!(matches!(err, SkiffError::InvalidCompose { .. }));
}

#[test]
fn cluster_image_storage_registry_requires_host() {
    let err = load(
        r#"
version: '2.4'
x-kube-compose:
  cluster_image_storage:
    type: docker_registry
"#,
    )
    .unwrap_err();
    assert!(matches!(err, SkiffError::InvalidCompose { .. }));
}

#[test]
fn malformed_x_kube_compose_is_rejected() {
    let err = load(
        r#"
version: '2'
services:
  asdf:
    image: ubuntu:latest
    ports: [8080]
x-kube-compose:
  push_images: ""
"#,
    )
    .unwrap_err();
    assert!(matches!(err, SkiffError::InvalidCompose { .. }));
}

#[test]
fn environment_forms_produce_equal_configs() {
    let map_form = load(
        r#"
version: '2'
services:
  app:
    image: img
    environment:
      A: '1'
      B: two
"#,
    )
    .unwrap();
    let list_form = load(
        r#"
version: '2'
services:
  app:
    image: img
    environment:
      - A=1
      - B=two
"#,
    )
    .unwrap();
    assert_eq!(
        map_form.find_service("app").unwrap().environment,
        list_form.find_service("app").unwrap().environment
    );
}

#[test]
fn filter_covers_dependency_closure() {
    let mut cfg = load(
        r#"
version: '2'
services:
  front:
    image: img
    depends_on: [mid]
  mid:
    image: img
    depends_on: [back]
  back:
    image: img
  lonely:
    image: img
"#,
    )
    .unwrap();
    cfg.add_to_filter("front");
    assert!(cfg.matches_filter("front"));
    assert!(cfg.matches_filter("mid"));
    assert!(cfg.matches_filter("back"));
    assert!(!cfg.matches_filter("lonely"));
}

#[test]
fn unsupported_version_is_rejected() {
    let err = load("version: 'asdf'\n").unwrap_err();
    assert!(matches!(err, SkiffError::UnsupportedVersion { .. }));
}

#[test]
fn invalid_service_name_is_rejected() {
    let err = load(
        r#"
version: '2'
services:
  '!!':
    image: ubuntu:latest
"#,
    )
    .unwrap_err();
    assert!(matches!(err, SkiffError::InvalidCompose { .. }));
}
