/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Controller against a real provider server over gRPC.

use common::capability::{Capability, CapabilitySet};
use common::setting::ControllerSettings;
use common::spec::{
    ProviderDescriptor, ProviderFamily, ResourceKey, VirtualMachine, VmPhase, VmSpec,
};
use common::error::ErrorKind;
use common::task::{OperationKind, TaskPhase};
use provider::runtime::{self, SimulatedHypervisor};
use provider::{ProviderReceiver, TaskTracker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use vmcontroller::grpc::sender::provider::GrpcProviderClient;
use vmcontroller::provider::{Operation, ProviderService, TaskPoll};
use vmcontroller::types::ReconcileOutcome;
use vmcontroller::{MemoryStore, ProviderRegistry, Reconciler, ResourceStore};

struct Cluster {
    sim: Arc<SimulatedHypervisor>,
    store: Arc<MemoryStore>,
    reconciler: Reconciler,
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<common::Result<()>>,
}

impl Cluster {
    async fn start(capabilities: CapabilitySet) -> Cluster {
        let sim = Arc::new(
            SimulatedHypervisor::new(ProviderFamily::Libvirt).with_capabilities(capabilities.clone()),
        );
        let receiver = ProviderReceiver::new(
            sim.clone(),
            TaskTracker::new(Duration::from_secs(60), 128),
            capabilities,
        )
        .with_job_poll_interval(Duration::from_millis(5));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(provider::serve_with_listener(receiver, listener, async {
            let _ = stopped.await;
        }));

        let registry = Arc::new(ProviderRegistry::new(Duration::from_secs(2)));
        registry
            .bind(&ProviderDescriptor {
                name: "lab".into(),
                family: ProviderFamily::Libvirt,
                endpoint: addr.to_string(),
                protocol_version: common::provider::PROTOCOL_VERSION.into(),
                credentials_ref: None,
            })
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let settings = ControllerSettings {
            backoff_jitter: 0.0,
            ..ControllerSettings::default()
        };
        let reconciler = Reconciler::new(store.clone(), registry, &settings);
        Cluster {
            sim,
            store,
            reconciler,
            addr,
            stop: Some(stop),
            server,
        }
    }

    /// Reconcile until `until` matches, sleeping between passes.
    async fn drive(&self, key: &ResourceKey, until: ReconcileOutcome) {
        let mut last = None;
        for _ in 0..100 {
            let outcome = self.reconciler.reconcile(key).await.unwrap();
            if outcome == until {
                return;
            }
            last = Some(outcome);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let vm = self.store.get(key).await.unwrap();
        panic!("never reached {until:?}, last {last:?}: {vm:?}");
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.server.await.unwrap().unwrap();
    }
}

/// Submit `op` through the gRPC client and poll it to a terminal phase.
async fn run_task(client: &GrpcProviderClient, vm_ref: &str, key: &str, op: Operation) -> TaskPoll {
    let handle = client.submit(vm_ref, key, op).await.unwrap();
    loop {
        let poll = client.poll_task(&handle).await.unwrap();
        if poll.phase.is_terminal() {
            return poll;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn spec(yaml: &str) -> VmSpec {
    serde_yaml::from_str(yaml).unwrap()
}

#[tokio::test]
async fn test_create_converge_and_delete() {
    let cluster = Cluster::start(runtime::default_capabilities(ProviderFamily::Libvirt)).await;
    let vm = cluster
        .store
        .apply(VirtualMachine::new(
            "default",
            "web",
            spec(
                "provider: lab\nimage: alpine\nclass:\n  cpus: 2\n  memoryMib: 1024\n\
                 disks:\n  - name: root\n    sizeGib: 10\nsnapshots: [baseline]\n",
            ),
        ))
        .unwrap();
    let key = vm.key();

    cluster.drive(&key, ReconcileOutcome::Steady).await;
    let vm = cluster.store.get(&key).await.unwrap().unwrap();
    assert_eq!(vm.status.phase, Some(VmPhase::Running));
    assert_eq!(vm.status.snapshots, vec!["baseline".to_string()]);
    assert!(vm.status.vm_id.is_some());
    assert_eq!(cluster.sim.power_of("7-default-web"), Some(common::spec::PowerState::On));
    assert_eq!(cluster.sim.side_effects(OperationKind::Create), 1);
    assert_eq!(cluster.sim.side_effects(OperationKind::SnapshotCreate), 1);

    // repeated passes at steady state issue nothing
    for _ in 0..3 {
        assert_eq!(
            cluster.reconciler.reconcile(&key).await.unwrap(),
            ReconcileOutcome::Steady
        );
    }
    assert_eq!(cluster.sim.side_effects(OperationKind::PowerOn), 1);

    cluster.store.request_deletion(&key).unwrap();
    cluster.drive(&key, ReconcileOutcome::Removed).await;
    assert!(cluster.store.get(&key).await.unwrap().is_none());
    assert_eq!(cluster.sim.vm_count(), 0);

    cluster.stop().await;
}

#[tokio::test]
async fn test_graceful_off_without_guest_agent_uses_hard_off() {
    let mut capabilities = runtime::default_capabilities(ProviderFamily::Libvirt);
    capabilities.remove(Capability::GuestAgent);
    let cluster = Cluster::start(capabilities).await;

    let key = cluster
        .store
        .apply(VirtualMachine::new(
            "default",
            "db",
            spec("provider: lab\nimage: alpine\n"),
        ))
        .unwrap()
        .key();
    cluster.drive(&key, ReconcileOutcome::Steady).await;

    cluster
        .store
        .apply(VirtualMachine::new(
            "default",
            "db",
            spec("provider: lab\nimage: alpine\npowerState: OffGraceful\n"),
        ))
        .unwrap();
    cluster.drive(&key, ReconcileOutcome::Steady).await;

    let vm = cluster.store.get(&key).await.unwrap().unwrap();
    assert_eq!(vm.status.phase, Some(VmPhase::Stopped));
    assert_eq!(cluster.sim.side_effects(OperationKind::PowerOffGraceful), 0);
    assert_eq!(cluster.sim.side_effects(OperationKind::PowerOff), 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_unreachable_provider_backs_off() {
    let cluster = Cluster::start(runtime::default_capabilities(ProviderFamily::Libvirt)).await;
    cluster.sim.set_reachable(false);
    let key = cluster
        .store
        .apply(VirtualMachine::new(
            "default",
            "web",
            spec("provider: lab\nimage: alpine\n"),
        ))
        .unwrap()
        .key();

    let outcome = cluster.reconciler.reconcile(&key).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Retry(_)), "{outcome:?}");
    let vm = cluster.store.get(&key).await.unwrap().unwrap();
    assert_ne!(vm.status.phase, Some(VmPhase::Failed));
    assert_eq!(vm.status.attempts, 1);

    cluster.sim.set_reachable(true);
    cluster.drive(&key, ReconcileOutcome::Steady).await;
    assert_eq!(cluster.sim.side_effects(OperationKind::Create), 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_snapshot_lifecycle_over_grpc() {
    let cluster = Cluster::start(runtime::default_capabilities(ProviderFamily::Vsphere)).await;
    let key = cluster
        .store
        .apply(VirtualMachine::new(
            "default",
            "web",
            spec("provider: lab\nimage: alpine\nsnapshots: [baseline]\n"),
        ))
        .unwrap()
        .key();
    cluster.drive(&key, ReconcileOutcome::Steady).await;
    let vm_ref = cluster.store.get(&key).await.unwrap().unwrap().vm_ref();

    let client = GrpcProviderClient::new(&cluster.addr.to_string(), Duration::from_secs(2)).unwrap();
    let reverted = run_task(
        &client,
        &vm_ref,
        "manual/1/snapshot-revert",
        Operation::SnapshotRevert {
            name: "baseline".into(),
        },
    )
    .await;
    assert_eq!(reverted.phase, TaskPhase::Succeeded, "{reverted:?}");
    assert_eq!(cluster.sim.side_effects(OperationKind::SnapshotRevert), 1);
    assert_eq!(cluster.sim.power_of(&vm_ref), Some(common::spec::PowerState::Off));

    let missing = run_task(
        &client,
        &vm_ref,
        "manual/1/snapshot-revert-ghost",
        Operation::SnapshotRevert {
            name: "ghost".into(),
        },
    )
    .await;
    assert_eq!(missing.phase, TaskPhase::Failed);
    assert_eq!(missing.error.map(|e| e.kind), Some(ErrorKind::NotFound));

    let deleted = run_task(
        &client,
        &vm_ref,
        "manual/1/snapshot-delete",
        Operation::SnapshotDelete {
            name: "baseline".into(),
        },
    )
    .await;
    assert_eq!(deleted.phase, TaskPhase::Succeeded, "{deleted:?}");
    let observed = client.describe(&vm_ref).await.unwrap().unwrap();
    assert!(observed.snapshots.is_empty());

    cluster.stop().await;
}
