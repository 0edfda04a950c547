use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::cell::RefCell;

use embassy_sync::blocking_mutex;

use crate::{
    BusTransport, ClientId, CompletionStatus, DefaultRawMutex, DoneQueue, Priority, Txn,
    TxnDoneCb, TxnError, TxnId, TxnOutcome, TxnResult, TxnStatus, MAX_CLIENTS, MAX_PRIORITIES,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Parameters of a [TxnQueue].
pub struct TxnQueueConfig {
    /// The maximum number of transactions per client and priority.
    pub queue_depth: usize,
}
impl Default for TxnQueueConfig {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

/// The run state of a client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientState {
    #[default]
    NotRegistered,
    /// Only the single step slot is served.
    Stopped,
    Running,
    /// A restart was requested, while a transaction of the client was in flight.
    PendingRestart,
}

/// Counters of a [TxnQueue].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxnQueueStats {
    /// Transactions handed to the bus.
    pub submitted: u32,
    /// Transactions, that completed synchronously.
    pub completed: u32,
    /// Transactions, that the bus reported as pending.
    pub pending: u32,
    /// Transactions, that failed synchronously or were rejected.
    pub failed: u32,
    /// Transactions delivered with [CompletionStatus::Recovery].
    pub recovered: u32,
    /// Queued transactions discarded by a restart or close.
    pub discarded: u32,
}

#[derive(Default)]
struct ClientInfo {
    state: ClientState,
    num_prios: usize,
    done_cb: Option<TxnDoneCb>,
    single_step: Option<Txn>,
    queues: [VecDeque<Txn>; MAX_PRIORITIES],
}
impl ClientInfo {
    fn is_registered(&self) -> bool {
        self.state != ClientState::NotRegistered
    }
    fn queued(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum::<usize>() + self.single_step.is_some() as usize
    }
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    id: TxnId,
    client: ClientId,
    /// The owner was cleared, while the transaction was on the bus.
    orphaned: bool,
}

struct TxnQueueState {
    clients: [ClientInfo; MAX_CLIENTS],
    in_flight: Option<InFlight>,
    /// The queue, that opened the current write burst.
    aggregation: Option<(ClientId, Priority)>,
    done: DoneQueue,
    busy: bool,
    reentry: bool,
    stats: TxnQueueStats,
}
impl TxnQueueState {
    fn client(&self, client: ClientId) -> Option<&ClientInfo> {
        self.clients
            .get(client.index())
            .filter(|info| info.is_registered())
    }
    fn client_mut(&mut self, client: ClientId) -> Option<&mut ClientInfo> {
        self.clients
            .get_mut(client.index())
            .filter(|info| info.is_registered())
    }
    /// Pick the next transaction to be sent.
    fn select_next(&mut self) -> Option<Txn> {
        if let Some((client, priority)) = self.aggregation {
            let Some(info) = self.client_mut(client) else {
                warn!("Client {} vanished mid burst. Releasing claim.", client.0);
                self.aggregation = None;
                return self.select_next();
            };
            // The burst has to continue from the same queue, so we wait for it to be refilled.
            let txn = info.queues[priority.index()].pop_front()?;
            if !txn.is_write() || txn.is_fixed_addr() {
                error!(
                    "Txn {} of client {} breaks the open burst, since it's a read or fixed address.",
                    txn.id().0,
                    client.0
                );
            }
            if !txn.is_aggregate() {
                trace!("Burst of client {} closed by txn {}.", client.0, txn.id().0);
                self.aggregation = None;
            }
            return Some(txn);
        }
        if let Some(txn) = self
            .clients
            .iter_mut()
            .filter(|info| info.is_registered())
            .find_map(|info| info.single_step.take())
        {
            return Some(txn);
        }
        for priority in Priority::ALL {
            for (id, info) in self.clients.iter_mut().enumerate() {
                if info.state != ClientState::Running || priority.index() >= info.num_prios {
                    continue;
                }
                let Some(txn) = info.queues[priority.index()].pop_front() else {
                    continue;
                };
                if txn.is_aggregate() && txn.is_write() {
                    trace!("Burst opened by txn {} of client {}.", txn.id().0, id);
                    self.aggregation = Some((ClientId(id as u8), priority));
                }
                return Some(txn);
            }
        }
        None
    }
    /// Remove everything queued for the client.
    ///
    /// An in flight transaction of the client keeps occupying the bus, but is dropped once it
    /// returns.
    fn clear_client(&mut self, client: ClientId) -> Vec<Txn> {
        if self
            .aggregation
            .is_some_and(|(claimed, _)| claimed == client)
        {
            self.aggregation = None;
        }
        if let Some(in_flight) = self
            .in_flight
            .as_mut()
            .filter(|in_flight| in_flight.client == client)
        {
            in_flight.orphaned = true;
        }
        let Some(info) = self.client_mut(client) else {
            return Vec::new();
        };
        info.state = ClientState::Running;
        let mut discarded: Vec<Txn> = info.single_step.take().into_iter().collect();
        for queue in info.queues.iter_mut() {
            discarded.extend(queue.drain(..));
        }
        for txn in discarded.iter_mut() {
            txn.set_status(CompletionStatus::Recovery);
        }
        self.stats.discarded += discarded.len() as u32;
        discarded
    }
    /// Release the in flight record for a transaction returned by the bus.
    ///
    /// Returns [None], if the transaction goes through the done queue as usual.
    fn release_in_flight(&mut self, id: TxnId, owner: ClientId) -> Option<Release> {
        let (client, orphaned) = match self.in_flight.take() {
            Some(in_flight) => {
                if in_flight.id != id {
                    error!(
                        "Completion of txn {}, while txn {} is in flight.",
                        id.0, in_flight.id.0
                    );
                }
                (in_flight.client, in_flight.orphaned)
            }
            None => {
                warn!("Completion of txn {} without a txn in flight.", id.0);
                (owner, false)
            }
        };
        if orphaned {
            self.stats.discarded += 1;
            return Some(Release::Orphaned);
        }
        let restarting = self
            .client(client)
            .is_some_and(|info| info.state == ClientState::PendingRestart);
        if !restarting {
            return None;
        }
        let discarded = self.clear_client(client).len();
        self.stats.recovered += 1;
        let done_cb = self.client(client).and_then(|info| info.done_cb.clone());
        Some(Release::Recovery { done_cb, discarded })
    }
}

/// What happens to a returned transaction, that bypasses the done queue.
enum Release {
    /// Its client was cleared in the meantime.
    Orphaned,
    /// It completes a pending restart of its client.
    Recovery {
        done_cb: Option<TxnDoneCb>,
        discarded: usize,
    },
}

/// A priority based transaction scheduler for multiple clients sharing one bus.
///
/// All operations take `&self` and may be called from any context, including the callbacks
/// invoked by the scheduler itself.
pub struct TxnQueue<B> {
    bus: B,
    config: TxnQueueConfig,
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<TxnQueueState>>,
}
impl<B: BusTransport> TxnQueue<B> {
    pub fn new(bus: B, config: TxnQueueConfig) -> Self {
        Self {
            bus,
            config,
            state: blocking_mutex::Mutex::new(RefCell::new(TxnQueueState {
                clients: Default::default(),
                in_flight: None,
                aggregation: None,
                done: DoneQueue::new(),
                busy: false,
                reentry: false,
                stats: TxnQueueStats::default(),
            })),
        }
    }
    /// Connect the done callback of the bus to [Self::transaction_done].
    pub fn connect(self: &Arc<Self>)
    where
        B: Send + Sync + 'static,
    {
        let txn_queue: Weak<Self> = Arc::downgrade(self);
        self.bus.connect(Arc::new(move |txn: Txn| match txn_queue.upgrade() {
            Some(txn_queue) => txn_queue.transaction_done(txn),
            None => warn!("Txn {} completed after the scheduler was dropped.", txn.id().0),
        }));
    }
    pub fn bus(&self) -> &B {
        &self.bus
    }
    pub fn config(&self) -> &TxnQueueConfig {
        &self.config
    }
    pub fn stats(&self) -> TxnQueueStats {
        self.state.lock(|state| state.borrow().stats)
    }
    /// Register a client.
    ///
    /// The client starts out stopped.
    pub fn open(&self, client: ClientId, num_prios: usize, done_cb: TxnDoneCb) -> TxnResult<()> {
        if !client.is_valid() {
            return Err(TxnError::InvalidClient);
        }
        if num_prios == 0 || num_prios > MAX_PRIORITIES {
            return Err(TxnError::InvalidPriority);
        }
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let info = &mut state.clients[client.index()];
            if info.is_registered() {
                return Err(TxnError::AlreadyOpen);
            }
            *info = ClientInfo {
                state: ClientState::Stopped,
                num_prios,
                done_cb: Some(done_cb),
                ..Default::default()
            };
            Ok(())
        })?;
        debug!("Client {} opened with {} priorities.", client.0, num_prios);
        Ok(())
    }
    /// Deregister a client, discarding everything it has queued.
    ///
    /// No callbacks are invoked.
    pub fn close(&self, client: ClientId) -> TxnResult<()> {
        let discarded = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.client(client).is_none() {
                return Err(TxnError::NotOpen);
            }
            let discarded = state.clear_client(client);
            state.clients[client.index()] = ClientInfo::default();
            Ok(discarded)
        })?;
        debug!(
            "Client {} closed. Discarded {} txns.",
            client.0,
            discarded.len()
        );
        Ok(())
    }
    fn set_run_state(&self, client: ClientId, run_state: ClientState) -> TxnResult<()> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let info = state.client_mut(client).ok_or(TxnError::NotOpen)?;
            if info.state != ClientState::PendingRestart {
                info.state = run_state;
            }
            Ok(())
        })
    }
    /// Allow the regular queues of the client to be served.
    pub fn run(&self, client: ClientId) -> TxnResult<()> {
        self.set_run_state(client, ClientState::Running)?;
        trace!("Client {} running.", client.0);
        self.run_pass(None);
        Ok(())
    }
    /// Stop serving the regular queues of the client.
    ///
    /// The single step slot is still served.
    pub fn stop(&self, client: ClientId) -> TxnResult<()> {
        self.set_run_state(client, ClientState::Stopped)?;
        trace!("Client {} stopped.", client.0);
        Ok(())
    }
    /// Hand a transaction to the scheduler.
    ///
    /// If the transaction is sent and finishes within this call, it is returned directly.
    /// Otherwise [TxnOutcome::Pending] is returned and the transaction will be delivered to the
    /// client's callback later. Transactions for unregistered clients, unopened priorities or
    /// full queues are returned as [TxnOutcome::Error].
    pub fn submit(&self, txn: Txn) -> TxnOutcome {
        let id = txn.id();
        let rejected = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let rejected = Self::enqueue(&mut state, txn, self.config.queue_depth);
            if rejected.is_some() {
                state.stats.failed += 1;
            }
            rejected
        });
        if let Some(mut txn) = rejected {
            txn.set_status(CompletionStatus::Error);
            return TxnOutcome::Error(txn);
        }
        self.run_pass(Some(id)).unwrap_or(TxnOutcome::Pending)
    }
    /// Put the transaction into the slot or queue of its client.
    ///
    /// Returns the transaction, if it was rejected.
    fn enqueue(state: &mut TxnQueueState, txn: Txn, queue_depth: usize) -> Option<Txn> {
        let client = txn.client();
        let Some(info) = state.client_mut(client) else {
            error!(
                "Txn {} rejected, since client {} isn't registered.",
                txn.id().0,
                client.0
            );
            return Some(txn);
        };
        if txn.priority().index() >= info.num_prios {
            error!(
                "Txn {} rejected, since client {} didn't open priority {}.",
                txn.id().0,
                client.0,
                txn.priority().index()
            );
            return Some(txn);
        }
        if txn.is_single_step() {
            if let Some(unsent) = info.single_step.replace(txn) {
                warn!(
                    "Single step txn {} of client {} replaced before being sent.",
                    unsent.id().0,
                    client.0
                );
            }
            return None;
        }
        let queue = &mut info.queues[txn.priority().index()];
        if queue.len() >= queue_depth {
            error!(
                "Txn {} rejected, since the queue of client {} is full.",
                txn.id().0,
                client.0
            );
            return Some(txn);
        }
        queue.push_back(txn);
        None
    }
    /// Restart a client.
    ///
    /// If a transaction of the client is in flight, [TxnStatus::Pending] is returned and the
    /// queues are cleared once it completes. That transaction is then delivered to the client's
    /// callback with [CompletionStatus::Recovery]. Otherwise the queues are cleared immediately.
    pub fn restart(&self, client: ClientId) -> TxnStatus {
        let discarded = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let in_flight = state
                .in_flight
                .is_some_and(|in_flight| in_flight.client == client && !in_flight.orphaned);
            let info = state.client_mut(client)?;
            if in_flight {
                info.state = ClientState::PendingRestart;
                return Some(None);
            }
            Some(Some(state.clear_client(client)))
        });
        match discarded {
            None => {
                error!("Restart of unregistered client {}.", client.0);
                TxnStatus::Error
            }
            Some(None) => {
                debug!("Restart of client {} deferred until its txn completes.", client.0);
                TxnStatus::Pending
            }
            Some(Some(discarded)) => {
                debug!(
                    "Client {} restarted. Discarded {} txns.",
                    client.0,
                    discarded.len()
                );
                TxnStatus::Complete
            }
        }
    }
    /// Remove everything queued for the client without invoking any callback.
    ///
    /// This also releases a burst claim of the client. An in flight transaction of the client
    /// still blocks the bus until it returns, but is then dropped. The client is set to running
    /// and the discarded transactions are handed back, marked with [CompletionStatus::Recovery].
    pub fn clear_queues(&self, client: ClientId) -> Vec<Txn> {
        self.state
            .lock(|state| state.borrow_mut().clear_client(client))
    }
    /// Return a transaction, that was reported as pending by the bus.
    pub fn transaction_done(&self, txn: Txn) {
        let released = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.release_in_flight(txn.id(), txn.client()) {
                Some(release) => Some((txn, release)),
                None => {
                    state.done.enqueue(txn);
                    None
                }
            }
        });
        if let Some((txn, release)) = released {
            self.finish_released(txn, release);
        }
        self.run_pass(None);
    }
    fn finish_released(&self, mut txn: Txn, release: Release) {
        match release {
            Release::Orphaned => {
                debug!(
                    "Dropping txn {}, since its client was cleared while it was in flight.",
                    txn.id().0
                );
            }
            Release::Recovery { done_cb, discarded } => {
                debug!(
                    "Txn {} recovered. Discarded {} queued txns.",
                    txn.id().0,
                    discarded
                );
                txn.set_status(CompletionStatus::Recovery);
                match done_cb {
                    Some(done_cb) => done_cb(txn),
                    None => warn!("No callback for recovered txn {}.", txn.id().0),
                }
            }
        }
    }
    /// The number of transactions queued by the client, including its single step slot.
    pub fn queued(&self, client: ClientId) -> usize {
        self.state.lock(|state| {
            state
                .borrow()
                .client(client)
                .map(ClientInfo::queued)
                .unwrap_or(0)
        })
    }
    pub fn client_state(&self, client: ClientId) -> ClientState {
        self.state.lock(|state| {
            state
                .borrow()
                .clients
                .get(client.index())
                .map(|info| info.state)
                .unwrap_or_default()
        })
    }
    /// Check if nothing is in flight, queued or waiting for its callback.
    pub fn is_idle(&self) -> bool {
        self.state.lock(|state| {
            let state = state.borrow();
            !state.busy
                && state.in_flight.is_none()
                && state.done.is_empty()
                && state.clients.iter().all(|info| info.queued() == 0)
        })
    }
    /// Run a scheduling pass.
    ///
    /// If a pass is already running, it's marked for another iteration and [None] is returned.
    /// Otherwise the outcome of the transaction `own` is returned, if it finished during the pass.
    fn run_pass(&self, own: Option<TxnId>) -> Option<TxnOutcome> {
        let entered = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.busy {
                state.reentry = true;
                false
            } else {
                state.busy = true;
                true
            }
        });
        if !entered {
            trace!("Scheduler busy. Requested another iteration.");
            return None;
        }
        let mut own_outcome = None;
        loop {
            self.submit_pending(own, &mut own_outcome);
            self.dispatch_done();
            let again = self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.reentry {
                    state.reentry = false;
                    true
                } else {
                    state.busy = false;
                    false
                }
            });
            if !again {
                break;
            }
        }
        own_outcome
    }
    /// Send transactions, until one is pending or nothing is left.
    fn submit_pending(&self, own: Option<TxnId>, own_outcome: &mut Option<TxnOutcome>) {
        loop {
            let next = self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.in_flight.is_some() {
                    return None;
                }
                let txn = state.select_next()?;
                state.in_flight = Some(InFlight {
                    id: txn.id(),
                    client: txn.client(),
                    orphaned: false,
                });
                state.stats.submitted += 1;
                Some(txn)
            });
            let Some(txn) = next else {
                return;
            };
            let id = txn.id();
            let outcome = self.bus.transact(txn);
            if outcome.is_pending() {
                trace!("Txn {} pending on the bus.", id.0);
                self.state
                    .lock(|state| state.borrow_mut().stats.pending += 1);
                return;
            }
            let is_own = own == Some(id);
            // The client may have been restarted or cleared during the transfer.
            let released = self.state.lock(|state| {
                let mut state = state.borrow_mut();
                match outcome {
                    TxnOutcome::Complete(_) => state.stats.completed += 1,
                    _ => state.stats.failed += 1,
                }
                let release = match state.in_flight.filter(|in_flight| in_flight.id == id) {
                    Some(in_flight) => state.release_in_flight(id, in_flight.client),
                    None => None,
                };
                match release {
                    Some(release) => outcome.into_txn().map(|txn| (txn, release)),
                    None if is_own => {
                        *own_outcome = Some(outcome);
                        None
                    }
                    None => {
                        if let Some(txn) = outcome.into_txn() {
                            state.done.enqueue(txn);
                        }
                        None
                    }
                }
            });
            if let Some((txn, release)) = released {
                self.finish_released(txn, release);
            }
        }
    }
    /// Hand all finished transactions to their client's callback.
    fn dispatch_done(&self) {
        loop {
            let next = self.state.lock(|state| {
                let mut state = state.borrow_mut();
                let txn = state.done.dequeue()?;
                let done_cb = state
                    .client(txn.client())
                    .and_then(|info| info.done_cb.clone());
                Some((txn, done_cb))
            });
            let Some((txn, done_cb)) = next else {
                return;
            };
            match done_cb {
                Some(done_cb) => done_cb(txn),
                None => warn!(
                    "Dropping txn {}, since client {} is gone.",
                    txn.id().0,
                    txn.client().0
                ),
            }
        }
    }
}
