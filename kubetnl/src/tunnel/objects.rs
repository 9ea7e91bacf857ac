//! Declarative specs for the cluster objects backing one tunnel.
//!
//! Builders are pure functions of the [`TunnelSpec`]: no I/O, no randomness.
//! That keeps them unit-testable by diffing generated specs against expected
//! field values.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, KeyToPath, Pod,
        PodSpec, Probe, Service, ServiceAccount, ServicePort, ServiceSpec, TCPSocketAction,
        Volume, VolumeMount,
    },
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use kubetnl_base::consts::{self, k8s::labels};

use crate::tunnel::TunnelSpec;

pub const CONTAINER_NAME: &str = "main";
pub const SSH_PORT_NAME: &str = "ssh";

const SCRIPT_VOLUME_NAME: &str = "scripts";
const SCRIPT_FILENAME: &str = "ssh-init.sh";
const SCRIPT_DIRECTORY: &str = "/custom-cont-init.d";

// Init fragment run by the daemon image before sshd starts. Reverse
// forwarding needs AllowTcpForwarding and GatewayPorts; the stock
// sshd_config of the image ships with both disabled.
const SCRIPT_CONTENTS: &str = r#"
#!/bin/bash
if [[ ! -z "${PORT}" ]]; then
  echo "Port ${PORT}" >> /etc/ssh/sshd_config
fi

sed -i 's/#AllowAgentForwarding yes/AllowAgentForwarding yes/g' /etc/ssh/sshd_config
sed -i 's/AllowTcpForwarding no/AllowTcpForwarding yes/g' /etc/ssh/sshd_config
sed -i 's/GatewayPorts no/GatewayPorts yes/g' /etc/ssh/sshd_config
sed -i 's/X11Forwarding no/X11Forwarding yes/g' /etc/ssh/sshd_config
"#;

fn tunnel_metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(BTreeMap::from_iter([(labels::TUNNEL.to_string(), name.to_string())])),
        ..ObjectMeta::default()
    }
}

pub fn service_account(spec: &TunnelSpec) -> ServiceAccount {
    ServiceAccount { metadata: tunnel_metadata(&spec.name), ..ServiceAccount::default() }
}

pub fn config_map(spec: &TunnelSpec) -> ConfigMap {
    ConfigMap {
        metadata: tunnel_metadata(&spec.name),
        data: Some(BTreeMap::from_iter([(
            SCRIPT_FILENAME.to_string(),
            SCRIPT_CONTENTS.to_string(),
        )])),
        ..ConfigMap::default()
    }
}

/// Builds the tunnel pod: the SSH daemon container exposing every mapped
/// service port plus the named `ssh` port, with the init script mounted into
/// the image's custom-init directory.
pub fn pod(spec: &TunnelSpec) -> Pod {
    let mut ports = spec
        .mappings
        .iter()
        .map(|mapping| ContainerPort {
            container_port: i32::from(mapping.container_port),
            protocol: Some(mapping.protocol.as_kubernetes().to_string()),
            ..ContainerPort::default()
        })
        .collect::<Vec<_>>();
    ports.push(ContainerPort {
        name: Some(SSH_PORT_NAME.to_string()),
        container_port: i32::from(spec.remote_ssh_port),
        ..ContainerPort::default()
    });

    let env = [
        ("PORT", spec.remote_ssh_port.to_string()),
        ("PASSWORD_ACCESS", "true".to_string()),
        ("USER_NAME", consts::SSH_USER.to_string()),
        ("USER_PASSWORD", consts::SSH_PASSWORD.to_string()),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..EnvVar::default()
    })
    .collect::<Vec<_>>();

    Pod {
        metadata: tunnel_metadata(&spec.name),
        spec: Some(PodSpec {
            service_account_name: Some(spec.name.clone()),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                ports: Some(ports),
                env: Some(env),
                volume_mounts: Some(vec![VolumeMount {
                    name: SCRIPT_VOLUME_NAME.to_string(),
                    mount_path: SCRIPT_DIRECTORY.to_string(),
                    ..VolumeMount::default()
                }]),
                readiness_probe: Some(Probe {
                    tcp_socket: Some(TCPSocketAction {
                        port: IntOrString::Int(i32::from(spec.remote_ssh_port)),
                        ..TCPSocketAction::default()
                    }),
                    initial_delay_seconds: Some(5),
                    period_seconds: Some(5),
                    failure_threshold: Some(3),
                    ..Probe::default()
                }),
                ..Container::default()
            }],
            volumes: Some(vec![Volume {
                name: SCRIPT_VOLUME_NAME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: spec.name.clone(),
                    items: Some(vec![KeyToPath {
                        key: SCRIPT_FILENAME.to_string(),
                        path: SCRIPT_FILENAME.to_string(),
                        ..KeyToPath::default()
                    }]),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// Builds the Service selecting the tunnel pod, one port per mapping, each
/// named by its index in the mapping list.
pub fn service(spec: &TunnelSpec) -> Service {
    let ports = spec
        .mappings
        .iter()
        .enumerate()
        .map(|(index, mapping)| ServicePort {
            name: Some(index.to_string()),
            port: i32::from(mapping.container_port),
            target_port: Some(IntOrString::Int(i32::from(mapping.container_port))),
            protocol: Some(mapping.protocol.as_kubernetes().to_string()),
            ..ServicePort::default()
        })
        .collect::<Vec<_>>();

    Service {
        metadata: tunnel_metadata(&spec.name),
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from_iter([(
                labels::TUNNEL.to_string(),
                spec.name.clone(),
            )])),
            ports: Some(ports),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{Mapping, Protocol};

    fn spec() -> TunnelSpec {
        TunnelSpec {
            name: "s1".to_string(),
            namespace: "default".to_string(),
            image: consts::DEFAULT_IMAGE.to_string(),
            mappings: vec![
                Mapping {
                    target_host: "127.0.0.1".to_string(),
                    target_port: 8080,
                    container_port: 80,
                    protocol: Protocol::Tcp,
                },
                Mapping {
                    target_host: "10.0.0.5".to_string(),
                    target_port: 9090,
                    container_port: 90,
                    protocol: Protocol::Udp,
                },
            ],
            local_ssh_port: 32222,
            remote_ssh_port: 2222,
            continue_on_tunnel_error: false,
        }
    }

    #[test]
    fn test_every_object_carries_the_tunnel_label() {
        let spec = spec();
        let expected = (labels::TUNNEL.to_string(), "s1".to_string());

        for labels in [
            service_account(&spec).metadata.labels,
            config_map(&spec).metadata.labels,
            pod(&spec).metadata.labels,
            service(&spec).metadata.labels,
        ] {
            let labels = labels.expect("labels should be set");
            assert_eq!(labels.len(), 1);
            assert_eq!(labels.iter().next().unwrap(), (&expected.0, &expected.1));
        }
    }

    #[test]
    fn test_config_map_holds_init_script() {
        let config_map = config_map(&spec());
        let data = config_map.data.expect("data should be set");

        let script = data.get(SCRIPT_FILENAME).expect("init script entry");
        assert!(script.contains("AllowTcpForwarding yes"));
        assert!(script.contains("GatewayPorts yes"));
    }

    #[test]
    fn test_pod_exposes_mapped_ports_and_ssh_port() {
        let pod = pod(&spec());
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, CONTAINER_NAME);

        let ports = container.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0].container_port, 80);
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(ports[1].container_port, 90);
        assert_eq!(ports[1].protocol.as_deref(), Some("UDP"));
        assert_eq!(ports[2].name.as_deref(), Some(SSH_PORT_NAME));
        assert_eq!(ports[2].container_port, 2222);
    }

    #[test]
    fn test_pod_env_matches_daemon_contract() {
        let pod = pod(&spec());
        let env = pod.spec.as_ref().unwrap().containers[0].env.as_ref().unwrap();

        let find = |name: &str| {
            env.iter().find(|var| var.name == name).and_then(|var| var.value.as_deref())
        };
        assert_eq!(find("PORT"), Some("2222"));
        assert_eq!(find("PASSWORD_ACCESS"), Some("true"));
        assert_eq!(find("USER_NAME"), Some("user"));
        assert_eq!(find("USER_PASSWORD"), Some("password"));
    }

    #[test]
    fn test_pod_readiness_probe_targets_ssh_port() {
        let pod = pod(&spec());
        let probe =
            pod.spec.as_ref().unwrap().containers[0].readiness_probe.as_ref().unwrap();

        assert_eq!(
            probe.tcp_socket.as_ref().unwrap().port,
            IntOrString::Int(2222)
        );
        assert_eq!(probe.initial_delay_seconds, Some(5));
        assert_eq!(probe.period_seconds, Some(5));
        assert_eq!(probe.failure_threshold, Some(3));
    }

    #[test]
    fn test_pod_references_service_account_and_script_volume() {
        let pod = pod(&spec());
        let pod_spec = pod.spec.as_ref().unwrap();

        assert_eq!(pod_spec.service_account_name.as_deref(), Some("s1"));

        let volume = &pod_spec.volumes.as_ref().unwrap()[0];
        assert_eq!(volume.config_map.as_ref().unwrap().name, "s1");

        let mount = &pod_spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, SCRIPT_DIRECTORY);
        assert_eq!(mount.name, volume.name);
    }

    #[test]
    fn test_service_ports_named_by_index() {
        let service = service(&spec());
        let service_spec = service.spec.as_ref().unwrap();

        assert_eq!(
            service_spec.selector.as_ref().unwrap().get(labels::TUNNEL).map(String::as_str),
            Some("s1")
        );

        let ports = service_spec.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].name.as_deref(), Some("0"));
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(80)));
        assert_eq!(ports[1].name.as_deref(), Some("1"));
        assert_eq!(ports[1].protocol.as_deref(), Some("UDP"));
    }
}
