use maplit::hashmap;
use membus::bus::{BusConnector, ConnectOpts, MemoryHub};
use membus::membership::{MemberEvent, MemberSet, Membership, MembershipCfg};
use membus::testkit::{FailureConfig, FailureConfigMap, LogLevel, Logger};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn agent(hub: &MemoryHub, url: &str, rank: i32) -> Membership {
  Membership::new(MembershipCfg {
    beat_duration: Duration::from_millis(25),
    lease_duration: Duration::from_millis(250),
    max_clock_skew: Duration::from_millis(50),
    my_rank: rank,
    bus_url: url.to_string(),
    connector: Arc::new(hub.clone()),
    log: Logger::stdout(LogLevel::Off),
    ..MembershipCfg::default()
  })
}

async fn converged<F: Fn() -> bool>(cond: F, within: Duration) -> bool {
  let deadline = tokio::time::Instant::now() + within;
  while tokio::time::Instant::now() < deadline {
    if cond() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  cond()
}

const CONVERGENCE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn leader_failure_promotes_the_survivor() {
  let hub = MemoryHub::new();
  let a = agent(&hub, "mem://a", 1);
  let b = agent(&hub, "mem://b", 0);
  a.start().await.unwrap();
  b.start().await.unwrap();
  let a_id = a.my_location().id;
  let b_id = b.my_location().id;

  assert!(
    converged(
      || a.leader().id == b_id && a.member_snapshot().len() == 2,
      CONVERGENCE
    )
    .await
  );

  // the leader goes dark; once its lease and the skew allowance lapse,
  // the survivor takes over
  let mut events = a.subscribe();
  b.stop().await;
  assert!(converged(|| a.leader().id == a_id, CONVERGENCE).await);
  assert!(a.leader().is_leader);

  tokio::time::sleep(Duration::from_millis(200)).await;
  let mut saw_lost_b = false;
  let mut saw_list = false;
  while let Ok(ev) = events.try_recv() {
    match ev {
      MemberEvent::Lost(set) => {
        saw_lost_b |= set.iter().any(|c| c.id == b_id);
      }
      MemberEvent::List(set) => {
        saw_list |= set.iter().any(|c| c.id == a_id);
      }
      MemberEvent::Gained(_) => {}
    }
  }
  assert!(saw_lost_b, "the departed leader was never reported lost");
  assert!(saw_list, "no membership list was published on re-election");

  a.stop().await;
}

#[tokio::test]
async fn severed_connection_recovers_with_the_same_identity() {
  let hub = MemoryHub::new();
  let a = agent(&hub, "mem://a", 1);
  let b = agent(&hub, "mem://b", 0);
  a.start().await.unwrap();
  b.start().await.unwrap();
  let a_id = a.my_location().id;
  let b_id = b.my_location().id;

  assert!(
    converged(
      || a.member_snapshot().len() == 2 && b.member_snapshot().len() == 2,
      CONVERGENCE
    )
    .await
  );

  assert_eq!(hub.sever("mem://a"), 1);

  // the agent reconnects on its own, keeps its identity, and the cluster
  // settles back to where it was
  assert!(
    converged(
      || a.member_snapshot().len() == 2 && b.member_snapshot().len() == 2,
      CONVERGENCE
    )
    .await
  );
  assert!(!a.halted());
  assert_eq!(a.my_location().id, a_id);
  assert_eq!(a.leader().id, b_id);

  a.stop().await;
  b.stop().await;
}

#[tokio::test]
async fn identity_change_after_reconnect_is_fatal() {
  let hub = MemoryHub::new();
  let a = agent(&hub, "mem://a", 0);
  a.start().await.unwrap();
  let a_id = a.my_location().id;
  assert!(converged(|| a.leader().id == a_id, CONVERGENCE).await);

  // monitoring some other server's health would be meaningless, so a new
  // identity on the same url must halt the agent
  hub.assign_new_identity("mem://a");
  hub.sever("mem://a");
  assert!(converged(|| a.halted(), CONVERGENCE).await);
}

#[tokio::test]
async fn malformed_pongs_are_dropped_not_fatal() {
  let hub = MemoryHub::new();
  let a = agent(&hub, "mem://a", 0);
  a.start().await.unwrap();
  let a_id = a.my_location().id;
  assert!(converged(|| a.leader().id == a_id, CONVERGENCE).await);

  let rogue = hub.connect("mem://rogue", ConnectOpts::default()).unwrap();
  for _ in 0..5 {
    rogue
      .publish("_nats.cluster.members.allreply", b"{definitely not json")
      .unwrap();
  }
  tokio::time::sleep(Duration::from_millis(200)).await;

  assert!(!a.halted());
  assert_eq!(a.leader().id, a_id);
  assert_eq!(a.member_snapshot().len(), 1);

  a.stop().await;
}

#[tokio::test]
async fn election_converges_over_a_lossy_bus() {
  let hub = MemoryHub::new();
  hub.set_failure(FailureConfigMap {
    cluster_wide: FailureConfig {
      drop_prob: 0.25,
      delay: Some((Duration::from_millis(1), Duration::from_millis(5))),
    },
    node_wide: hashmap! {
      "mem://a".to_string() => FailureConfig {
        drop_prob: 0.4,
        delay: None,
      },
    },
  });

  let a = agent(&hub, "mem://a", 1);
  let b = agent(&hub, "mem://b", 0);
  a.start().await.unwrap();
  b.start().await.unwrap();
  let b_id = b.my_location().id;

  // dropped pongs cost rounds, not correctness: the lease rides out the
  // gaps and both agents still settle on the strongest candidate
  assert!(
    converged(
      || a.leader().id == b_id && b.leader().id == b_id,
      CONVERGENCE
    )
    .await
  );

  a.stop().await;
  b.stop().await;
}

#[tokio::test]
async fn published_lists_decode_as_member_sets() {
  let hub = MemoryHub::new();
  let payloads: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
  let tap = hub.connect("mem://tap", ConnectOpts::default()).unwrap();
  let sink = payloads.clone();
  tap
    .subscribe(
      "_nats.cluster.members.list",
      Box::new(move |msg| sink.lock().unwrap().push(msg.data)),
    )
    .unwrap();

  let a = agent(&hub, "mem://a", 0);
  a.start().await.unwrap();
  let a_id = a.my_location().id;
  assert!(
    converged(|| !payloads.lock().unwrap().is_empty(), CONVERGENCE).await
  );

  let bytes = payloads.lock().unwrap().first().unwrap().clone();
  let set = MemberSet::from_bytes(&bytes).unwrap();
  assert!(set.iter().any(|c| c.id == a_id));

  a.stop().await;
}
