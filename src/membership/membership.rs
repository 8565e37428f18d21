use crate::bus::{Bus, BusConnector, BusError, ConnectOpts, MemoryHub};
use crate::membership::{
  Candidate, Halter, LeadHolder, MemberSet, MembershipError, PongCollector,
  SYS_MEMBER_PREFIX,
};
use crate::testkit::Logger;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const RECONNECT_TRIES: usize = 8;

/// Configures a [`Membership`] agent. Set once at construction.
#[derive(Clone)]
pub struct MembershipCfg {
  /// The length of one heartbeat window: how long the agent waits for
  /// pongs after each allcall ping.
  ///
  /// default: `100 milliseconds`
  pub beat_duration: Duration,
  /// How long an accepted leader stays leader without re-election.
  ///
  /// default: `1 second`
  pub lease_duration: Duration,
  /// Additive grace applied to foreign lease expirations, covering
  /// bounded clock skew between hosts.
  ///
  /// default: `1 second`
  pub max_clock_skew: Duration,
  /// Depth of the accepted-leader history ring. Zero upgrades to the
  /// default.
  ///
  /// default: `100`
  pub history_count: usize,
  /// Operator-assigned leadership priority for this agent. Lower is
  /// stronger.
  ///
  /// default: `0`
  pub my_rank: i32,
  /// Address of the bus endpoint this agent monitors.
  pub bus_url: String,
  /// When set the agent goes observe-only: its subscriptions drop all
  /// traffic and it emits no events, neither on the bus nor to local
  /// subscribers. Used to fake dead agents in tests.
  pub deaf: Arc<AtomicBool>,
  /// Where this agent logs. Every agent carries its own handle.
  pub log: Logger,
  /// Produces bus connections for `bus_url`.
  pub connector: Arc<dyn BusConnector>,
}

impl Default for MembershipCfg {
  fn default() -> Self {
    MembershipCfg {
      beat_duration: Duration::from_millis(100),
      lease_duration: Duration::from_millis(1000),
      max_clock_skew: Duration::from_secs(1),
      history_count: 100,
      my_rank: 0,
      bus_url: "mem://local".to_string(),
      deaf: Arc::new(AtomicBool::new(false)),
      log: Logger::default(),
      connector: Arc::new(MemoryHub::new()),
    }
  }
}

/// What a membership round observed, mirrored to local subscribers as it
/// is published on the bus.
///
/// Delivery is at-least-once across the cluster: consumers must tolerate
/// duplicate `Lost` and `Gained` notifications.
#[derive(Clone, Debug)]
pub enum MemberEvent {
  /// Agents present in the previous round and missing from this one.
  Lost(MemberSet),
  /// Agents new in this round.
  Gained(MemberSet),
  /// The full member set, emitted when a lease expired and an election
  /// ran.
  List(MemberSet),
}

pub(crate) struct Subjects {
  pub all_call: String,
  pub all_reply: String,
  pub member_lost: String,
  pub member_added: String,
  pub membership_list: String,
}

impl Subjects {
  fn new() -> Subjects {
    Subjects {
      all_call: format!("{}allcall", SYS_MEMBER_PREFIX),
      all_reply: format!("{}allreply", SYS_MEMBER_PREFIX),
      member_lost: format!("{}lost", SYS_MEMBER_PREFIX),
      member_added: format!("{}added", SYS_MEMBER_PREFIX),
      membership_list: format!("{}list", SYS_MEMBER_PREFIX),
    }
  }
}

/// Tracks cluster membership through heartbeats on the bus, elects a
/// leader under the lease discipline, and reports membership changes.
///
/// One instance rides in each process of the cluster. After [`start`],
/// the agent pings on every beat, gathers pongs, and converges with its
/// peers on a single leader without any further coordination; the election
/// verdict is a pure function of the observed member set, so every agent
/// reaches it independently.
///
/// [`start`]: Membership::start
pub struct Membership {
  inner: Arc<Inner>,
}

struct Inner {
  cfg: MembershipCfg,
  subj: Subjects,
  pc: PongCollector,
  elec: LeadHolder,
  bus: Mutex<Option<Arc<dyn Bus>>>,
  my_loc: Mutex<Candidate>,
  last_set: Mutex<MemberSet>,
  halt: Halter,
  stopping: Mutex<bool>,
  need_reconnect_tx: mpsc::Sender<()>,
  need_reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
  subscribers: Mutex<Vec<mpsc::UnboundedSender<MemberEvent>>>,
  weak: Weak<Inner>,
}

impl Membership {
  pub fn new(cfg: MembershipCfg) -> Membership {
    // capacity 1 plus try_send coalesces disconnect signals
    let (tx, rx) = mpsc::channel(1);
    let history_count = cfg.history_count;
    let max_clock_skew = cfg.max_clock_skew;
    let inner = Arc::new_cyclic(|weak| Inner {
      subj: Subjects::new(),
      pc: PongCollector::new(),
      elec: LeadHolder::new(history_count, max_clock_skew),
      bus: Mutex::new(None),
      my_loc: Mutex::new(Candidate::default()),
      last_set: Mutex::new(MemberSet::new()),
      halt: Halter::new(),
      stopping: Mutex::new(false),
      need_reconnect_tx: tx,
      need_reconnect_rx: Mutex::new(Some(rx)),
      subscribers: Mutex::new(Vec::new()),
      weak: weak.clone(),
      cfg: cfg,
    });
    Membership { inner: inner }
  }

  /// Connects to the bus, resolves this agent's identity, subscribes the
  /// membership topics, and spawns the heartbeat loop. Must be called
  /// from within a tokio runtime.
  pub async fn start(&self) -> Result<(), MembershipError> {
    if let Err(e) = self.inner.setup_bus_client() {
      self.inner.halt.done.close();
      return Err(e);
    }
    tokio::spawn(self.inner.clone().run());
    Ok(())
  }

  /// Requests a halt and waits for the loop to acknowledge. Idempotent:
  /// when a stop is already underway this returns immediately.
  pub async fn stop(&self) {
    {
      let mut stopping = self.inner.stopping.lock().unwrap();
      if *stopping {
        return;
      }
      *stopping = true;
    }
    self.inner.halt.req_stop.close();
    if self.inner.need_reconnect_rx.lock().unwrap().is_some() {
      // never started, there is no loop to wait on
      self.inner.halt.done.close();
    }
    self.inner.halt.done.wait().await;
    let bus = self.inner.bus.lock().unwrap().take();
    if let Some(bus) = bus {
      bus.close();
    }
  }

  /// A copy of the currently believed leader. Empty id when no leader has
  /// been accepted yet.
  pub fn leader(&self) -> Candidate {
    self.inner.elec.get_leader()
  }

  /// A copy of the member set observed in the most recent completed
  /// round.
  pub fn member_snapshot(&self) -> MemberSet {
    self.inner.last_set.lock().unwrap().clone()
  }

  /// This agent's own identity as resolved from the bus. Empty before
  /// [`start`](Membership::start) succeeds.
  pub fn my_location(&self) -> Candidate {
    self.inner.my_loc.lock().unwrap().clone()
  }

  /// Streams [`MemberEvent`] to the caller. Receivers that fall away are
  /// pruned on the next send.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MemberEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.inner.subscribers.lock().unwrap().push(tx);
    rx
  }

  /// The accepted-leader history, oldest first. Diagnostics only.
  pub fn history_snapshot(&self) -> Vec<Candidate> {
    self.inner.elec.history_snapshot()
  }

  /// True once the loop has terminated, whether by [`stop`] or a fatal
  /// error.
  ///
  /// [`stop`]: Membership::stop
  pub fn halted(&self) -> bool {
    self.inner.halt.done.is_closed()
  }

  pub fn deaf(&self) -> bool {
    self.inner.deaf()
  }

  pub fn set_deaf(&self) {
    self.inner.cfg.deaf.store(true, Ordering::Relaxed);
  }

  pub fn un_deaf(&self) {
    self.inner.cfg.deaf.store(false, Ordering::Relaxed);
  }
}

impl Inner {
  fn deaf(&self) -> bool {
    self.cfg.deaf.load(Ordering::Relaxed)
  }

  fn bus(&self) -> Result<Arc<dyn Bus>, BusError> {
    self.bus.lock().unwrap().clone().ok_or(BusError::Closed)
  }

  fn my_loc(&self) -> Candidate {
    self.my_loc.lock().unwrap().clone()
  }

  fn bus_err(&self, e: BusError) -> MembershipError {
    MembershipError::BusUnreachable {
      url: self.cfg.bus_url.clone(),
      reason: e.to_string(),
    }
  }

  /// Connects and wires up every subscription. Also used verbatim by the
  /// reconnect path, which is why the identity check lives here.
  fn setup_bus_client(&self) -> Result<(), MembershipError> {
    let opts = ConnectOpts {
      no_reconnect: true,
      dont_randomize: true,
    };
    let bus = self
      .cfg
      .connector
      .connect(&self.cfg.bus_url, opts)
      .map_err(|e| self.bus_err(e))?;

    let tx = self.need_reconnect_tx.clone();
    bus.set_disconnect_handler(Box::new(move || {
      let _ = tx.try_send(());
    }));

    let loc = bus.server_location().map_err(|e| self.bus_err(e))?;
    let fresh = Candidate::new(&loc.id, &loc.host, loc.port, self.cfg.my_rank);
    let first = {
      let mut my = self.my_loc.lock().unwrap();
      let first = my.id.is_empty();
      if !first && !my.same_identity(&fresh) {
        let was = my.to_string();
        drop(my);
        bus.close();
        return Err(MembershipError::LocationChanged {
          was: was,
          now: fresh.to_string(),
        });
      }
      *my = fresh.clone();
      first
    };
    if first {
      self.elec.set_my_loc(&fresh);
      self.cfg.log.debug(format!(
        "health-agent: I am '{}' at '{}:{}', rank {}",
        fresh.id, fresh.host, fresh.port, fresh.rank
      ));
    }

    // pongs feed the collector; undecodable payloads are logged and
    // dropped, never propagated
    let weak = self.weak.clone();
    bus
      .subscribe(
        &self.subj.all_reply,
        Box::new(move |msg| {
          let m = match weak.upgrade() {
            Some(m) => m,
            None => return,
          };
          if m.deaf() {
            return;
          }
          if let Err(e) = m.pc.receive_pong(&msg.data) {
            m.cfg
              .log
              .warn(format!("health-agent: dropping pong: {}", e));
          }
        }),
      )
      .map_err(|e| self.bus_err(e))?;

    // an allcall says "here's my leader, who is out there?"; we answer
    // with our own location
    let weak = self.weak.clone();
    bus
      .subscribe(
        &self.subj.all_call,
        Box::new(move |msg| {
          let m = match weak.upgrade() {
            Some(m) => m,
            None => return,
          };
          if m.deaf() {
            return;
          }
          let bus = match m.bus() {
            Ok(b) => b,
            Err(_) => return,
          };
          let loc = match bus.server_location() {
            Ok(l) => l,
            // try again on the next beat
            Err(_) => return,
          };
          let me = {
            let my = m.my_loc.lock().unwrap();
            if my.id != loc.id || my.host != loc.host || my.port != loc.port {
              m.cfg.log.error(format!(
                "health-agent: agent location changed, was '{}', now '{}:{}'. halting",
                *my, loc.host, loc.port
              ));
              m.halt.req_stop.close();
              return;
            }
            my.clone()
          };
          if let Some(reply) = msg.reply_to {
            let _ = bus.publish(&reply, &me.to_bytes());
          }
        }),
      )
      .map_err(|e| self.bus_err(e))?;

    // reporting taps on the event topics
    for subj in [
      &self.subj.member_lost,
      &self.subj.member_added,
      &self.subj.membership_list,
    ] {
      let weak = self.weak.clone();
      bus
        .subscribe(
          subj,
          Box::new(move |msg| {
            let m = match weak.upgrade() {
              Some(m) => m,
              None => return,
            };
            if m.deaf() {
              return;
            }
            m.cfg.log.trace(format!(
              "health-agent: received on [{}]: '{}'",
              msg.subject,
              String::from_utf8_lossy(&msg.data)
            ));
          }),
        )
        .map_err(|e| self.bus_err(e))?;
    }

    *self.bus.lock().unwrap() = Some(bus);
    Ok(())
  }

  async fn run(self: Arc<Self>) {
    if let Err(e) = self.beat_loop().await {
      match e {
        MembershipError::Shutdown => {}
        e => self
          .cfg
          .log
          .error(format!("health-agent: terminating on: {}", e)),
      }
    }
    // the halt is terminal: drop the connection so nothing publishes past
    // this point, the pong handlers included
    let bus = self.bus.lock().unwrap().take();
    if let Some(bus) = bus {
      bus.close();
    }
    self.halt.done.close();
  }

  async fn beat_loop(&self) -> Result<(), MembershipError> {
    let mut reconnect_rx = self
      .need_reconnect_rx
      .lock()
      .unwrap()
      .take()
      .expect("membership started twice");

    self
      .cfg
      .log
      .debug(format!("health-agent: listening on [{}]", self.subj.all_call));

    // initial allcall to discover any current leader
    if let Err(e) = self.allcall() {
      self
        .cfg
        .log
        .debug(format!("health-agent: error on initial allcall: {}", e));
    }
    self
      .beat_wait(&mut reconnect_rx, self.cfg.beat_duration)
      .await?;

    let (mut prev_count, mut prev_set) = self.pc.get_set_and_clear(&self.my_loc());
    *self.last_set.lock().unwrap() = prev_set.clone();

    let now = Utc::now();
    let first_seen_lead = self.elec.get_leader();
    let limit = first_seen_lead.lease_expires + to_chrono(self.cfg.max_clock_skew);
    if !first_seen_lead.lease_is_zero() && limit > now {
      self.cfg.log.debug(format!(
        "health-agent: after one heartbeat, detected leader '{}' of rank {} with lease good until '{}'",
        first_seen_lead.id, first_seen_lead.rank, limit
      ));
    } else {
      // any stale lease out there must be allowed to lapse before we
      // claim anything
      self.cfg.log.trace(format!(
        "health-agent: after one heartbeat, no leader found. waiting out a full lease term of {:?}",
        self.cfg.lease_duration
      ));
      self
        .beat_wait(&mut reconnect_rx, self.cfg.lease_duration)
        .await?;
    }

    let mut prev_lead = self.elec.get_leader();
    let mut next_lead_report: Option<DateTime<Utc>> = None;

    loop {
      // replies to this allcall only feed the pong collector; the
      // believed leader changes in the election step below
      if let Err(e) = self.allcall() {
        // usually the connection tearing down. if it dropped, the wait
        // below sees the disconnect signal and reconnects
        self
          .cfg
          .log
          .trace(format!("health-agent: error on allcall: {}", e));
      }
      self
        .beat_wait(&mut reconnect_rx, self.cfg.beat_duration)
        .await?;

      let (cur_count, cur_set) = self.pc.get_set_and_clear(&self.my_loc());
      let now = Utc::now();

      let (expired, mut cur_lead) = leader_lease_check(
        &cur_set,
        now,
        self.cfg.lease_duration,
        &prev_lead,
        self.cfg.max_clock_skew,
      );
      let (won, effective) = self.elec.set_leader(&cur_lead);
      if !won {
        cur_lead = effective;
      }

      self.report_lead(now, &cur_lead, &prev_lead, &mut next_lead_report);

      let lost = MemberSet::set_diff(&prev_set, &cur_set, &cur_lead);
      let gained = MemberSet::set_diff(&cur_set, &prev_set, &cur_lead);
      let same = MemberSet::sets_equal(&prev_set, &cur_set);

      if !same {
        if !lost.is_empty() {
          self.publish_set(&self.subj.member_lost, &lost);
          self.notify(MemberEvent::Lost(lost.clone()));
        }
        if !gained.is_empty() {
          self.publish_set(&self.subj.member_added, &gained);
          self.notify(MemberEvent::Gained(gained.clone()));
        }
      }

      if cur_count < prev_count {
        self.cfg.log.warn(format!(
          "health-agent: went down from {} to {} members. lost: '{}'",
          prev_count, cur_count, lost
        ));
      } else if cur_count > prev_count && prev_count > 0 {
        self.cfg.log.debug(format!(
          "health-agent: went up from {} to {} members. gained: '{}'",
          prev_count, cur_count, gained
        ));
      }

      if expired {
        self.publish_set(&self.subj.membership_list, &cur_set);
        self.notify(MemberEvent::List(cur_set.clone()));
      }

      *self.last_set.lock().unwrap() = cur_set.clone();
      prev_set = cur_set;
      prev_count = cur_count;
      prev_lead = cur_lead;
    }
  }

  /// Broadcasts a ping carrying the believed leader, lease and contact
  /// info included, and asks every agent to answer on the reply topic.
  fn allcall(&self) -> Result<(), BusError> {
    let lead_by = self.elec.leader_as_bytes();
    self
      .bus()?
      .publish_request(&self.subj.all_call, &self.subj.all_reply, &lead_by)
  }

  /// Sleeps for `dur`, racing the halt request and the disconnect signal.
  /// A disconnect rolls straight into the reconnect path and the round
  /// resumes once a fresh connection is up.
  async fn beat_wait(
    &self,
    reconnect_rx: &mut mpsc::Receiver<()>,
    dur: Duration,
  ) -> Result<(), MembershipError> {
    let disconnected = tokio::select! {
      _ = sleep(dur) => false,
      _ = self.halt.req_stop.wait() => return Err(MembershipError::Shutdown),
      _ = reconnect_rx.recv() => true,
    };
    if disconnected {
      self.reconnect().await?;
      // signals raised while we were reconnecting refer to the dead
      // connection; the fresh one starts clean
      while reconnect_rx.try_recv().is_ok() {}
    }
    Ok(())
  }

  async fn reconnect(&self) -> Result<(), MembershipError> {
    // drop the old connection outright; we only ever watch the one
    // server we were configured with
    let old = self.bus.lock().unwrap().take();
    if let Some(old) = old {
      old.close();
    }
    let mut backoff = RECONNECT_BASE;
    for attempt in 1..=RECONNECT_TRIES {
      match self.setup_bus_client() {
        Ok(()) => {
          self.cfg.log.debug(format!(
            "health-agent: reconnected to '{}' on attempt {}",
            self.cfg.bus_url, attempt
          ));
          return Ok(());
        }
        Err(e @ MembershipError::LocationChanged { .. }) => return Err(e),
        Err(e) => {
          self.cfg.log.debug(format!(
            "health-agent: reconnect attempt {} failed: {}",
            attempt, e
          ));
        }
      }
      let jitter = Duration::from_millis(rand::random::<u64>() % 250);
      tokio::select! {
        _ = sleep(backoff + jitter) => {}
        _ = self.halt.req_stop.wait() => return Err(MembershipError::Shutdown),
      }
      backoff = std::cmp::min(backoff * 2, RECONNECT_CAP);
    }
    Err(MembershipError::BusUnreachable {
      url: self.cfg.bus_url.clone(),
      reason: "reconnect attempts exhausted".to_string(),
    })
  }

  fn publish_set(&self, subject: &str, set: &MemberSet) {
    if self.deaf() {
      return;
    }
    let bus = match self.bus() {
      Ok(b) => b,
      Err(_) => return,
    };
    // a lost notification is not worth crashing a round over
    if let Err(e) = bus.publish(subject, &set.to_bytes()) {
      self.cfg.log.warn(format!(
        "health-agent: publish on [{}] failed: {}",
        subject, e
      ));
    }
  }

  fn notify(&self, event: MemberEvent) {
    // deaf means observe-only: local subscribers go quiet along with the
    // bus topics
    if self.deaf() {
      return;
    }
    self
      .subscribers
      .lock()
      .unwrap()
      .retain(|s| s.send(event.clone()).is_ok());
  }

  /// Leadership reporting, throttled to roughly once per remaining lease
  /// and re-armed whenever leadership changes hands.
  fn report_lead(
    &self,
    now: DateTime<Utc>,
    cur_lead: &Candidate,
    prev_lead: &Candidate,
    next_report: &mut Option<DateTime<Utc>>,
  ) {
    let my = self.my_loc();
    let due = next_report.map_or(true, |t| now > t);
    if my.id == cur_lead.id {
      if due || prev_lead.id != cur_lead.id {
        let left = (cur_lead.lease_expires - now).num_milliseconds();
        self.cfg.log.debug(format!(
          "health-agent: I am lead. id '{}', rank {}, port {}. lease expires in {}ms",
          my.id, my.rank, my.port, left
        ));
        *next_report = Some(cur_lead.lease_expires + chrono::Duration::seconds(1));
      }
    } else if !prev_lead.id.is_empty() && prev_lead.id == my.id {
      self.cfg.log.debug(format!(
        "health-agent: I am no longer lead. new lead is '{}', rank {}, port {}",
        cur_lead.id, cur_lead.rank, cur_lead.port
      ));
    } else if due {
      if cur_lead.id.is_empty() {
        self.cfg.log.debug(format!(
          "health-agent: I am '{}', rank {}, port {}. lead is unknown",
          my.id, my.rank, my.port
        ));
      } else {
        let left = (cur_lead.lease_expires - now).num_milliseconds();
        self.cfg.log.debug(format!(
          "health-agent: not lead. lead is '{}', rank {}, port {}, for {}ms",
          cur_lead.id, cur_lead.rank, cur_lead.port, left
        ));
        *next_report = Some(cur_lead.lease_expires + chrono::Duration::seconds(1));
      }
    }
  }
}

/// Evaluates the lease as of `now` and names the leader or best candidate.
///
/// While any outstanding lease, stretched by `max_clock_skew`, is still in
/// force it is honored: `prev_lead` comes back with `expired == false`.
/// The stretch is inclusive, so a lease at exactly the skew boundary still
/// holds. An empty member set also returns `prev_lead` unchanged; no
/// leader is invented from nothing. Otherwise the best candidate under the
/// election order wins, marked leader with a fresh lease, and
/// `expired == true` signals that a re-election took place.
///
/// This is where the actual election happens. Every agent feeding the
/// same inputs through this function reaches the same verdict.
pub fn leader_lease_check(
  members: &MemberSet,
  now: DateTime<Utc>,
  lease_len: Duration,
  prev_lead: &Candidate,
  max_clock_skew: Duration,
) -> (bool, Candidate) {
  if prev_lead.lease_expires + to_chrono(max_clock_skew) >= now {
    return (false, prev_lead.clone());
  }
  let mut lead = match members.min_rank() {
    Some(c) => c,
    None => return (false, prev_lead.clone()),
  };
  lead.is_leader = true;
  lead.lease_expires = now + to_chrono(lease_len);
  (true, lead)
}

fn to_chrono(d: Duration) -> chrono::Duration {
  chrono::Duration::from_std(d).expect("duration fits in chrono range")
}
