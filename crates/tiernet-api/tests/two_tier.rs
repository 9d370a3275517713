//! Root and cluster tiers talking over real HTTP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tiernet_api::{cluster_router, root_router};
use tiernet_discovery::{
    ChildMessage, HttpClusterNotifier, HttpParentClient, Publication, RetryPolicy,
    ServiceDescriptor, Tier, TopicBus,
};
use tiernet_state::{ClusterStatus, StateStore};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const JOB: &str = "app.default.web.test";

async fn serve(router: axum::Router) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2)
        .with_initial_backoff(20)
        .with_timeout(2000)
}

struct Hierarchy {
    root: Arc<Tier>,
    cluster: Arc<Tier>,
    bus: TopicBus,
}

async fn hierarchy() -> Hierarchy {
    let root_store = StateStore::open_in_memory().unwrap();
    let notifier = HttpClusterNotifier::new(root_store.clone(), fast_retry()).unwrap();
    let root = Arc::new(Tier::root(root_store, Arc::new(notifier)));
    let root_port = serve(root_router(root.clone())).await;

    let parent =
        HttpParentClient::new(format!("http://127.0.0.1:{root_port}"), "c1", fast_retry()).unwrap();
    let bus = TopicBus::new(64);
    let cluster = Arc::new(Tier::cluster(
        "c1",
        StateStore::open_in_memory().unwrap(),
        Arc::new(parent),
        Arc::new(bus.clone()),
    ));
    let cluster_port = serve(cluster_router(cluster.clone())).await;
    cluster
        .register_with_parent("127.0.0.1", cluster_port)
        .await
        .unwrap();

    let registrar = root.registrar().unwrap();
    let descriptor = ServiceDescriptor {
        app_name: "app".to_string(),
        app_ns: "default".to_string(),
        service_name: "web".to_string(),
        service_ns: "test".to_string(),
        ..Default::default()
    };
    registrar.register_job(&descriptor, "sys-1").unwrap();
    registrar.add_instances("sys-1", 1, "c1").unwrap();

    Hierarchy { root, cluster, bus }
}

/// Drain every publication currently buffered for the subscriber.
async fn drain(rx: &mut broadcast::Receiver<Publication>) -> Vec<Publication> {
    let mut received = Vec::new();
    while let Ok(Ok(publication)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
    {
        received.push(publication);
    }
    received
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_query_resolves_through_parent() {
    let h = hierarchy().await;
    let mut rx = h.bus.subscribe();

    let reply = h
        .cluster
        .handle_publication("nodes/w1/net/tablequery/request", json!({ "sname": JOB }))
        .await
        .unwrap();
    let Some(ChildMessage::TableQueryResult(result)) = reply else {
        panic!("expected a table query result");
    };
    assert_eq!(result.app_name, JOB);
    assert_eq!(result.instance_list.len(), 1);
    let service_ip = &result.instance_list[0].service_ip;
    assert_eq!(service_ip.len(), 2);
    assert_eq!(service_ip[0].address.as_deref(), Some("10.30.0.0"));
    assert_eq!(service_ip[1].address.as_deref(), Some("172.30.0.0"));

    // The root now knows the cluster relies on the job.
    assert_eq!(
        h.root.interests().interested_parties(JOB).unwrap(),
        vec!["c1".to_string()]
    );
    let published = drain(&mut rx).await;
    assert_eq!(published[0].topic, "nodes/w1/net/tablequery/result");

    // Unknown names come back empty, not as errors.
    let reply = h
        .cluster
        .handle_publication("nodes/w1/net/tablequery/request", json!({ "sname": "ghost" }))
        .await
        .unwrap();
    let Some(ChildMessage::TableQueryResult(result)) = reply else {
        panic!("expected a table query result");
    };
    assert!(result.instance_list.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deploy_report_reaches_root_and_comes_back_down() {
    let h = hierarchy().await;
    h.cluster
        .handle_publication("nodes/w1/net/tablequery/request", json!({ "sname": JOB }))
        .await
        .unwrap();
    let mut rx = h.bus.subscribe();

    h.cluster
        .handle_publication(
            "nodes/w2/net/service/deployed",
            json!({
                "appname": JOB,
                "instance_number": 0,
                "nsip": "10.18.0.5",
                "host_ip": "192.168.1.10",
                "host_port": 50100
            }),
        )
        .await
        .unwrap();

    let job = h.root.store().get_job(JOB).unwrap().unwrap();
    assert_eq!(job.instance_list[0].host_port, Some(50100));
    assert_eq!(
        h.root.store().get_cluster("c1").unwrap().unwrap().status,
        ClusterStatus::Active
    );

    let notifications: Vec<_> = drain(&mut rx)
        .await
        .into_iter()
        .filter(|p| p.topic == "nodes/w1/net/deploy/notify")
        .collect();
    assert!(!notifications.is_empty());
    assert_eq!(notifications[0].payload["type"], "DEPLOYMENT");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subnet_and_interest_lifecycle() {
    let h = hierarchy().await;

    let reply = h
        .cluster
        .handle_publication("nodes/w1/net/subnet", json!({ "METHOD": "GET" }))
        .await
        .unwrap();
    let Some(ChildMessage::SubnetResult(subnet)) = reply else {
        panic!("expected a subnet result");
    };
    assert_eq!(subnet.address.as_deref(), Some("172.18.0.0"));
    assert_eq!(subnet.address_v6.as_deref(), Some("fc00::"));

    h.cluster
        .handle_publication("nodes/w1/net/subnet", json!({ "METHOD": "DELETE" }))
        .await
        .unwrap();
    assert!(h.cluster.store().get_node("w1").unwrap().is_none());
    // The released pair is handed out again first.
    assert_eq!(
        h.root.request_subnet().await.unwrap().subnet_addr.as_deref(),
        Some("172.18.0.0")
    );

    h.cluster
        .handle_publication("nodes/w1/net/tablequery/request", json!({ "sname": JOB }))
        .await
        .unwrap();
    h.cluster
        .handle_publication("nodes/w1/net/interest/remove", json!({ "appname": JOB }))
        .await
        .unwrap();

    assert!(h.cluster.store().get_job(JOB).unwrap().is_none());
    assert!(!h.root.interests().is_relevant(JOB).unwrap());
    assert!(h.root.store().get_job(JOB).unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn root_undeploy_reaches_workers() {
    let h = hierarchy().await;
    h.cluster
        .handle_publication("nodes/w1/net/tablequery/request", json!({ "sname": JOB }))
        .await
        .unwrap();
    let mut rx = h.bus.subscribe();

    let outcome = h
        .root
        .registrar()
        .unwrap()
        .undeploy_instance("sys-1", 0)
        .await
        .unwrap();
    assert_eq!(outcome.notified, 1);

    let cached = h.cluster.store().get_job(JOB).unwrap().unwrap();
    assert!(cached.instance_list.is_empty());
    let published = drain(&mut rx).await;
    assert!(published.iter().any(|p| p.topic == "nodes/w1/net/deploy/notify"
        && p.payload["type"] == "UNDEPLOYMENT"));
}
