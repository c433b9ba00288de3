use super::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use kubert::index::IndexNamespacedResource;
use purger_core::{PodStatus, INSTANCE_LABEL};
use tracing::Level;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .try_init()
        .ok();
}

pub fn mk_pod(
    ns: impl ToString,
    name: impl ToString,
    instance: Option<&str>,
    ip: &str,
    ready: &[bool],
    ports: Vec<(&str, i32)>,
) -> k8s::Pod {
    k8s::Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: instance.map(|i| {
                maplit::btreemap! {
                    INSTANCE_LABEL.to_string() => i.to_string(),
                    "app".to_string() => "nginx".to_string(),
                }
            }),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            containers: vec![
                k8s::Container {
                    name: "nginx".to_string(),
                    ports: Some(
                        ports
                            .into_iter()
                            .map(|(name, port)| k8s::ContainerPort {
                                name: Some(name.to_string()),
                                container_port: port,
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                },
                k8s::Container {
                    name: "sidecar".to_string(),
                    ports: Some(vec![k8s::ContainerPort {
                        name: Some(MANAGEMENT_PORT_NAME.to_string()),
                        container_port: 1234,
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            pod_ip: Some(ip.to_string()),
            container_statuses: Some(
                ready
                    .iter()
                    .enumerate()
                    .map(|(i, ready)| k8s::ContainerStatus {
                        name: format!("c{i}"),
                        ready: *ready,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

fn mk_replica(name: &str, instance: &str, ip: &str) -> k8s::Pod {
    mk_pod(
        "rpaas",
        name,
        Some(instance),
        ip,
        &[true, true],
        vec![("http", 8080), (MANAGEMENT_PORT_NAME, 8889)],
    )
}

fn running(address: &str) -> PodStatus {
    PodStatus {
        address: address.to_string(),
        running: true,
    }
}

#[test]
fn lists_pods_by_exact_instance() {
    init_tracing();

    let mut index = Index::default();
    index.apply(mk_replica("sample-rpaasv2-0", "sample-rpaasv2", "172.0.2.1"));
    index.apply(mk_replica("sample-rpaasv2-1", "sample-rpaasv2", "172.0.2.2"));
    index.apply(mk_replica("sample-0", "sample", "172.0.3.1"));
    index.apply(mk_pod(
        "rpaas",
        "unlabeled",
        None,
        "172.0.4.1",
        &[true],
        vec![(MANAGEMENT_PORT_NAME, 8889)],
    ));
    assert_eq!(index.len(), 3);

    let pods = index.list_pods("sample-rpaasv2").expect("instance must exist");
    assert_eq!(
        pods,
        InstancePods {
            pods: vec![running("172.0.2.1"), running("172.0.2.2")],
            management_port: 8889,
        }
    );

    let pods = index.list_pods("sample").expect("instance must exist");
    assert_eq!(pods.pods, vec![running("172.0.3.1")]);
}

#[test]
fn pods_are_listed_in_a_stable_order() {
    let mut index = Index::default();
    index.apply(mk_replica("c", "inst", "10.0.0.3"));
    index.apply(mk_replica("a", "inst", "10.0.0.1"));
    index.apply(mk_replica("b", "inst", "10.0.0.2"));

    let addresses = index
        .list_pods("inst")
        .expect("instance must exist")
        .pods
        .into_iter()
        .map(|p| p.address)
        .collect::<Vec<_>>();
    assert_eq!(addresses, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
}

#[test]
fn running_requires_every_container_ready() {
    let mut index = Index::default();
    let ports = || vec![(MANAGEMENT_PORT_NAME, 8889)];
    index.apply(mk_pod("ns", "a", Some("inst"), "10.0.0.1", &[true, true], ports()));
    index.apply(mk_pod("ns", "b", Some("inst"), "10.0.0.2", &[true, false], ports()));
    index.apply(mk_pod("ns", "c", Some("inst"), "10.0.0.3", &[false], ports()));

    let pods = index.list_pods("inst").expect("instance must exist").pods;
    assert_eq!(
        pods.iter().map(|p| p.running).collect::<Vec<_>>(),
        [true, false, false]
    );
}

#[test]
fn management_port_is_read_from_first_container() {
    let mut index = Index::default();
    index.apply(mk_pod(
        "ns",
        "a",
        Some("inst"),
        "10.0.0.1",
        &[true],
        vec![("http", 8080)],
    ));

    // The sidecar declares the port name, but only the first container is consulted.
    let error = index
        .list_pods("inst")
        .expect_err("port must not be found");
    assert_eq!(
        error.to_string(),
        format!("pod ns/a of instance inst has no {MANAGEMENT_PORT_NAME} port")
    );
}

#[test]
fn pods_without_an_address_are_not_listed() {
    let mut index = Index::default();
    index.apply(mk_replica("a", "inst", "10.0.0.1"));
    let mut pending = mk_replica("b", "inst", "");
    pending.status = None;
    index.apply(pending);
    assert_eq!(index.len(), 2);

    assert_eq!(
        index.list_pods("inst").expect("instance must exist"),
        InstancePods {
            pods: vec![running("10.0.0.1")],
            management_port: 8889,
        }
    );

    index.delete("rpaas".to_string(), "a".to_string());
    let error = index
        .list_pods("inst")
        .expect_err("pending pods must not be listed");
    assert_eq!(error.to_string(), "no pods found for instance inst");
}

#[test]
fn unknown_instance_is_not_found() {
    let index = Index::default();
    let error = index.list_pods("missing").expect_err("must not be found");
    assert_eq!(error.to_string(), "no pods found for instance missing");
}

#[test]
fn deleted_pods_are_removed() {
    let mut index = Index::default();
    index.apply(mk_replica("a", "inst", "10.0.0.1"));
    index.apply(mk_replica("b", "inst", "10.0.0.2"));

    index.delete("rpaas".to_string(), "a".to_string());
    assert_eq!(
        index.list_pods("inst").expect("instance must exist").pods,
        vec![running("10.0.0.2")]
    );

    index.delete("rpaas".to_string(), "b".to_string());
    assert!(index.list_pods("inst").is_err());
    assert!(index.is_empty());

    // Deleting an unknown pod is a no-op.
    index.delete("rpaas".to_string(), "b".to_string());
}

#[test]
fn relabeled_pods_move_between_instances() {
    let mut index = Index::default();
    index.apply(mk_replica("a", "one", "10.0.0.1"));
    index.apply(mk_replica("a", "two", "10.0.0.1"));

    assert!(index.list_pods("one").is_err());
    assert_eq!(
        index.list_pods("two").expect("instance must exist").pods,
        vec![running("10.0.0.1")]
    );

    index.apply(mk_pod(
        "rpaas",
        "a",
        None,
        "10.0.0.1",
        &[true],
        vec![(MANAGEMENT_PORT_NAME, 8889)],
    ));
    assert!(index.list_pods("two").is_err());
    assert!(index.is_empty());
}

#[test]
fn updates_replace_pod_state() {
    let mut index = Index::default();
    let ports = || vec![(MANAGEMENT_PORT_NAME, 8889)];
    index.apply(mk_pod("ns", "a", Some("inst"), "10.0.0.1", &[false], ports()));
    index.apply(mk_pod("ns", "a", Some("inst"), "10.0.0.9", &[true], ports()));

    assert_eq!(
        index.list_pods("inst").expect("instance must exist").pods,
        vec![running("10.0.0.9")]
    );
    assert_eq!(index.len(), 1);
}

#[tokio::test]
async fn indexes_watch_events() {
    init_tracing();

    let index = Index::shared();
    let mut prom = prometheus_client::registry::Registry::default();
    let metrics = metrics::IndexMetrics::register(index.clone(), &mut prom).shared();

    let events = futures::stream::iter(vec![
        watcher::Event::Apply(mk_replica("a", "inst", "10.0.0.1")),
        watcher::Event::Apply(mk_replica("b", "inst", "10.0.0.2")),
        watcher::Event::Delete(mk_replica("a", "inst", "10.0.0.1")),
    ]);
    kubert::index::namespaced(metrics, events).await;

    assert_eq!(
        index.read().list_pods("inst").expect("instance must exist"),
        InstancePods {
            pods: vec![running("10.0.0.2")],
            management_port: 8889,
        }
    );
}
