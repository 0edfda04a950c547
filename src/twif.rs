use alloc::{
    sync::{Arc, Weak},
    vec,
};
use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex;
use embassy_time::{Duration, Timer};

use crate::{
    sync::{RestartSignal, WorkSignal},
    BusTransport, ClientId, CompletionStatus, DefaultRawMutex, DoneQueue, FailureKind, Priority,
    RestartOutcome, Txn, TxnDoneCb, TxnOutcome, TxnQueue, TxnQueueConfig, TxnStatus,
    MAX_PRIORITIES,
};

/// The number of memory partitions of the device.
pub const NUM_PARTITIONS: usize = 4;

/// Callback invoked, when a transaction fails on the bus.
pub type ErrorCb = Arc<dyn Fn(FailureKind) + Send + Sync>;
/// Callback invoked, once a restart finished or timed out.
pub type RecoveryCb = Arc<dyn Fn(RestartOutcome) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Parameters of a [TwIf].
pub struct TwIfConfig {
    /// How long a restart may wait for a transaction in flight.
    pub restart_timeout: Duration,
    /// The address of the ELP control register.
    pub elp_ctrl_addr: u32,
    /// The address of the first partition register.
    pub partition_regs_addr: u32,
    pub queue: TxnQueueConfig,
}
impl Default for TwIfConfig {
    fn default() -> Self {
        Self {
            restart_timeout: Duration::from_millis(100),
            elp_ctrl_addr: 0x1fffc,
            partition_regs_addr: 0x1ffc0,
            queue: TxnQueueConfig::default(),
        }
    }
}

/// The power state of the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    Awake,
    #[default]
    Asleep,
    /// The device was told to wake up, but didn't signal availability yet.
    WaitHw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum PowerEvent {
    Start,
    Sleep,
    HwAvailable,
}

/// Value written to the ELP control register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ElpRequest {
    Sleep = 0,
    Wake = 1,
}

/// What has to be done for a state transition, in this order.
#[derive(Clone, Copy, Debug, Default)]
struct PowerActions {
    stop: bool,
    elp: Option<ElpRequest>,
    run: bool,
}
impl PowerState {
    fn on_event(self, event: PowerEvent) -> Option<(Self, PowerActions)> {
        match (self, event) {
            (Self::Awake, PowerEvent::Sleep) => Some((
                Self::Asleep,
                PowerActions {
                    stop: true,
                    elp: Some(ElpRequest::Sleep),
                    ..Default::default()
                },
            )),
            (Self::Asleep, PowerEvent::Start) => Some((
                Self::WaitHw,
                PowerActions {
                    elp: Some(ElpRequest::Wake),
                    ..Default::default()
                },
            )),
            (Self::Asleep, PowerEvent::HwAvailable) => Some((
                Self::Awake,
                PowerActions {
                    elp: Some(ElpRequest::Wake),
                    run: true,
                    ..Default::default()
                },
            )),
            (Self::WaitHw, PowerEvent::HwAvailable) => Some((
                Self::Awake,
                PowerActions {
                    run: true,
                    ..Default::default()
                },
            )),
            _ => None,
        }
    }
}

/// A region of the device address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Partition {
    pub addr: u32,
    pub size: u32,
}

/// A snapshot of the state of a [TwIf].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TwIfInfo {
    pub power_state: PowerState,
    pub awake_count: u32,
    pub pending_count: u32,
    /// Finished transactions, that weren't handled yet.
    pub done_queued: usize,
    pub restart_pending: bool,
}

struct TwIfState {
    power_state: PowerState,
    awake_count: u32,
    pending_count: u32,
    /// Memory region first, register region second.
    partitions: [Partition; NUM_PARTITIONS],
    done: DoneQueue,
    error_cb: Option<ErrorCb>,
    recovery_cb: Option<RecoveryCb>,
}
impl TwIfState {
    fn is_idle(&self) -> bool {
        self.awake_count == 0 && self.pending_count == 0
    }
    /// Translate a device address into the bus address space.
    fn translate(&self, addr: u32) -> u32 {
        let [memory, registers, ..] = self.partitions;
        if addr >= registers.addr && addr <= registers.addr.wrapping_add(registers.size) {
            addr.wrapping_sub(registers.addr).wrapping_add(memory.size)
        } else {
            addr.wrapping_sub(memory.addr)
        }
    }
}

/// Power management for the WLAN client of a [TxnQueue].
///
/// The device is put to sleep, once no transactions are pending and nobody requested it to stay
/// awake. The WLAN queues are only served, while the device is awake.
pub struct TwIf<B: BusTransport> {
    txn_queue: Arc<TxnQueue<B>>,
    config: TwIfConfig,
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<TwIfState>>,
    done_signal: WorkSignal,
    restart_signal: RestartSignal,
}
impl<B: BusTransport> TwIf<B> {
    /// Create the scheduler for `bus` and register the WLAN client with it.
    ///
    /// The device is assumed to be asleep.
    pub fn new(bus: B, config: TwIfConfig) -> Arc<Self>
    where
        B: Send + Sync + 'static,
    {
        let txn_queue = Arc::new(TxnQueue::new(bus, config.queue));
        txn_queue.connect();
        Arc::new_cyclic(|twif: &Weak<Self>| {
            let twif = twif.clone();
            let done_cb: TxnDoneCb = Arc::new(move |txn: Txn| match twif.upgrade() {
                Some(twif) => twif.on_txn_done(txn),
                None => warn!("Txn {} completed after TwIf was dropped.", txn.id().0),
            });
            if let Err(err) = txn_queue.open(ClientId::WLAN, MAX_PRIORITIES, done_cb) {
                error!("Failed to open the WLAN client: {:?}", err);
            }
            Self {
                txn_queue,
                config,
                state: blocking_mutex::Mutex::new(RefCell::new(TwIfState {
                    power_state: PowerState::Asleep,
                    awake_count: 0,
                    pending_count: 0,
                    partitions: [Partition::default(); NUM_PARTITIONS],
                    done: DoneQueue::new(),
                    error_cb: None,
                    recovery_cb: None,
                })),
                done_signal: WorkSignal::new(),
                restart_signal: RestartSignal::new(),
            }
        })
    }
    /// The scheduler, which other clients can register with.
    pub fn txn_queue(&self) -> &Arc<TxnQueue<B>> {
        &self.txn_queue
    }
    pub fn config(&self) -> &TwIfConfig {
        &self.config
    }
    pub fn info(&self) -> TwIfInfo {
        self.state.lock(|state| {
            let state = state.borrow();
            TwIfInfo {
                power_state: state.power_state,
                awake_count: state.awake_count,
                pending_count: state.pending_count,
                done_queued: state.done.len(),
                restart_pending: self.restart_signal.is_armed(),
            }
        })
    }
    pub fn register_error_cb(&self, error_cb: impl Fn(FailureKind) + Send + Sync + 'static) {
        let error_cb: ErrorCb = Arc::new(error_cb);
        self.state
            .lock(|state| state.borrow_mut().error_cb = Some(error_cb));
    }
    pub fn register_recovery_cb(
        &self,
        recovery_cb: impl Fn(RestartOutcome) + Send + Sync + 'static,
    ) {
        let recovery_cb: RecoveryCb = Arc::new(recovery_cb);
        self.state
            .lock(|state| state.borrow_mut().recovery_cb = Some(recovery_cb));
    }

    fn raise(&self, event: PowerEvent) {
        let transition = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let previous = state.power_state;
            let (next, actions) = previous.on_event(event)?;
            state.power_state = next;
            Some((previous, next, actions))
        });
        let Some((previous, next, actions)) = transition else {
            trace!("Ignoring power event {:?}.", event);
            return;
        };
        debug!("Power state {:?} -> {:?}.", previous, next);
        if actions.stop {
            self.stop_wlan();
        }
        if let Some(request) = actions.elp {
            self.write_elp(request);
        }
        if actions.run {
            if let Err(err) = self.txn_queue.run(ClientId::WLAN) {
                error!("Failed to run the WLAN client: {:?}", err);
            }
        }
    }
    fn raise_sleep_if_idle(&self) {
        if self.state.lock(|state| state.borrow().is_idle()) {
            self.raise(PowerEvent::Sleep);
        }
    }
    fn stop_wlan(&self) {
        if let Err(err) = self.txn_queue.stop(ClientId::WLAN) {
            error!("Failed to stop the WLAN client: {:?}", err);
        }
    }
    fn write_elp(&self, request: ElpRequest) {
        let txn = Txn::write(
            ClientId::WLAN,
            Priority::High,
            self.config.elp_ctrl_addr,
            vec![request as u8],
        )
        .with_single_step(true);
        if let TxnOutcome::Error(_) = self.txn_queue.submit(txn) {
            error!("ELP write failed.");
            self.report_error(FailureKind::BusFailure);
        }
    }
    fn report_error(&self, kind: FailureKind) {
        match self.state.lock(|state| state.borrow().error_cb.clone()) {
            Some(error_cb) => error_cb(kind),
            None => warn!("Bus failure without an error callback."),
        }
    }
    fn notify_recovery(&self, outcome: RestartOutcome) {
        match self.state.lock(|state| state.borrow().recovery_cb.clone()) {
            Some(recovery_cb) => recovery_cb(outcome),
            None => warn!("Restart finished without a recovery callback."),
        }
    }

    /// Request the device to stay awake, until [Self::sleep] is called.
    pub fn awake(&self) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.awake_count = state.awake_count.saturating_add(1);
        });
        self.raise(PowerEvent::Start);
    }
    /// Release a request made through [Self::awake].
    ///
    /// Redundant calls are tolerated.
    pub fn sleep(&self) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.awake_count = state.awake_count.saturating_sub(1);
        });
        self.raise_sleep_if_idle();
    }
    /// Signal, that the device powered up.
    pub fn hw_available(&self) {
        self.raise(PowerEvent::HwAvailable);
    }

    /// Submit a transaction of the WLAN client.
    ///
    /// The address is translated through the current partitions. If the transaction is
    /// pending, its own done callback is invoked from [Self::handle_txn_done] later on.
    pub fn submit(&self, mut txn: Txn) -> TxnOutcome {
        let hw_addr = self
            .state
            .lock(|state| state.borrow().translate(txn.hw_addr()));
        txn.set_hw_addr(hw_addr);
        self.submit_untranslated(txn)
    }
    fn submit_untranslated(&self, txn: Txn) -> TxnOutcome {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.pending_count = state.pending_count.saturating_add(1);
        });
        let outcome = self.txn_queue.submit(txn);
        match outcome.status() {
            TxnStatus::Pending => self.raise(PowerEvent::Start),
            TxnStatus::Complete => self.txn_finished(),
            TxnStatus::Error => {
                self.txn_finished();
                self.report_error(FailureKind::BusFailure);
            }
        }
        outcome
    }
    fn txn_finished(&self) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.pending_count = state.pending_count.saturating_sub(1);
        });
        self.raise_sleep_if_idle();
    }
    /// Read the firmware status, after the device raised an interrupt.
    ///
    /// The interrupt implies, that the device is available, so the read goes out at high
    /// priority without waiting for a wake up.
    pub fn submit_read_fw_status(&self, mut txn: Txn) -> TxnOutcome {
        self.hw_available();
        txn.set_priority(Priority::High);
        self.submit(txn)
    }
    /// Configure the memory partitions of the device.
    ///
    /// The first partition is the memory region and the second one the register region, which
    /// are used for translating addresses from then on. The partition registers are written
    /// with untranslated low priority transactions.
    pub fn set_partition(&self, partitions: &[Partition; NUM_PARTITIONS]) -> TxnStatus {
        self.state
            .lock(|state| state.borrow_mut().partitions = *partitions);
        // Only the address of the last partition is written.
        let values = partitions
            .iter()
            .flat_map(|partition| [partition.addr, partition.size])
            .take(NUM_PARTITIONS * 2 - 1);
        let mut status = TxnStatus::Complete;
        for (index, value) in values.enumerate() {
            let txn = Txn::write(
                ClientId::WLAN,
                Priority::Low,
                self.config.partition_regs_addr + (index * 4) as u32,
                value.to_le_bytes().to_vec(),
            );
            match self.submit_untranslated(txn).status() {
                TxnStatus::Error => status = TxnStatus::Error,
                TxnStatus::Pending if status == TxnStatus::Complete => status = TxnStatus::Pending,
                _ => {}
            }
        }
        status
    }

    /// Called by the scheduler for every finished WLAN transaction.
    fn on_txn_done(&self, txn: Txn) {
        if txn.status() == CompletionStatus::Recovery {
            self.restart_completed(txn);
            return;
        }
        if txn.is_single_step() {
            trace!("ELP txn {} done.", txn.id().0);
            return;
        }
        self.state
            .lock(|state| state.borrow_mut().done.enqueue(txn));
        self.done_signal.raise();
    }
    /// Handle all finished transactions.
    ///
    /// This is meant to be called from the driver context, after [Self::process_txn_done] or
    /// another notification. A failed transaction invokes the error callback and stops the
    /// processing. The remaining transactions are left for the next call.
    pub fn handle_txn_done(&self) {
        let mut handled = false;
        loop {
            let Some(mut txn) = self.state.lock(|state| state.borrow_mut().done.dequeue()) else {
                break;
            };
            if txn.status() == CompletionStatus::Error {
                error!("Txn {} failed on the bus.", txn.id().0);
                self.report_error(FailureKind::BusFailure);
                if self.state.lock(|state| !state.borrow().done.is_empty()) {
                    self.done_signal.raise();
                }
                return;
            }
            if let Some(done_cb) = txn.take_done_cb() {
                done_cb(txn);
            }
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                state.pending_count = state.pending_count.saturating_sub(1);
            });
            handled = true;
        }
        if handled {
            self.raise_sleep_if_idle();
        }
    }
    /// Wait for finished transactions and handle them.
    pub async fn process_txn_done(&self) {
        self.done_signal.wait().await;
        self.handle_txn_done();
    }

    /// Restart the WLAN client.
    ///
    /// The device is considered asleep afterwards and all finished transactions are dropped. If
    /// a WLAN transaction is in flight, [TxnStatus::Pending] is returned and the restart finishes
    /// once it completes or [Self::restart_timeout] is called. Either way, the recovery callback
    /// is invoked exactly once.
    pub fn restart(&self) -> TxnStatus {
        let dropped = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.power_state = PowerState::Asleep;
            state.awake_count = 0;
            state.pending_count = 0;
            state.done.clear()
        });
        self.done_signal.take();
        debug!("Restarting. Dropped {} finished txns.", dropped);
        self.restart_signal.arm();
        match self.txn_queue.restart(ClientId::WLAN) {
            TxnStatus::Pending => {
                debug!("Restart pending on the txn in flight.");
                TxnStatus::Pending
            }
            TxnStatus::Complete => {
                self.restart_signal.reset();
                self.stop_wlan();
                TxnStatus::Complete
            }
            TxnStatus::Error => {
                self.restart_signal.reset();
                TxnStatus::Error
            }
        }
    }
    fn restart_completed(&self, txn: Txn) {
        if !self.restart_signal.finish(RestartOutcome::Completed) {
            warn!("Txn {} recovered without a pending restart.", txn.id().0);
            return;
        }
        debug!("Restart completed by txn {}.", txn.id().0);
        self.stop_wlan();
        self.notify_recovery(RestartOutcome::Completed);
    }
    /// Give up waiting for a pending restart.
    ///
    /// The WLAN queues are cleared forcibly. This does nothing, if the restart already finished.
    pub fn restart_timeout(&self) {
        if !self.restart_signal.finish(RestartOutcome::TimedOut) {
            trace!("Restart guard expired after the restart finished.");
            return;
        }
        let discarded = self.txn_queue.clear_queues(ClientId::WLAN);
        error!(
            "Restart timed out. Discarded {} txns.",
            discarded.len()
        );
        self.stop_wlan();
        self.notify_recovery(RestartOutcome::TimedOut);
    }
    /// Wait for a pending restart to finish, applying the restart timeout.
    ///
    /// Returns [None], if no restart is pending.
    pub async fn supervise_restart(&self) -> Option<RestartOutcome> {
        if self.restart_signal.is_idle() {
            return None;
        }
        match select(
            self.restart_signal.wait(),
            Timer::after(self.config.restart_timeout),
        )
        .await
        {
            Either::First(outcome) => Some(outcome),
            Either::Second(()) => {
                self.restart_timeout();
                Some(self.restart_signal.wait().await)
            }
        }
    }
}
impl<B: BusTransport> Drop for TwIf<B> {
    fn drop(&mut self) {
        if let Err(err) = self.txn_queue.close(ClientId::WLAN) {
            warn!("Failed to close the WLAN client: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::{vec, vec::Vec};
    use std::sync::Mutex;

    use embassy_futures::block_on;

    use super::*;
    use crate::{mock::MockBus, ClientState};

    fn twif() -> Arc<TwIf<MockBus>> {
        TwIf::new(MockBus::new(), TwIfConfig::default())
    }
    fn bus(twif: &TwIf<MockBus>) -> &MockBus {
        twif.txn_queue().bus()
    }
    /// The values written to the ELP register so far.
    fn elp_writes(twif: &TwIf<MockBus>) -> Vec<u8> {
        bus(twif)
            .sent()
            .into_iter()
            .filter(|sent| sent.single_step && sent.hw_addr == twif.config().elp_ctrl_addr)
            .map(|sent| sent.data[0])
            .collect()
    }
    fn wlan_state(twif: &TwIf<MockBus>) -> ClientState {
        twif.txn_queue().client_state(ClientId::WLAN)
    }
    fn wake_up(twif: &TwIf<MockBus>) {
        twif.awake();
        twif.hw_available();
        assert_eq!(twif.info().power_state, PowerState::Awake);
    }

    #[test]
    fn power_state_transitions() {
        let twif = twif();
        let info = twif.info();
        assert_eq!(info.power_state, PowerState::Asleep);
        assert_eq!((info.awake_count, info.pending_count), (0, 0));
        assert_eq!(wlan_state(&twif), ClientState::Stopped);

        twif.awake();
        assert_eq!(twif.info().power_state, PowerState::WaitHw);
        assert_eq!(elp_writes(&twif), vec![1]);
        assert_eq!(wlan_state(&twif), ClientState::Stopped);

        twif.hw_available();
        assert_eq!(twif.info().power_state, PowerState::Awake);
        assert_eq!(wlan_state(&twif), ClientState::Running);
        assert_eq!(elp_writes(&twif), vec![1]);

        twif.sleep();
        assert_eq!(twif.info().power_state, PowerState::Asleep);
        assert_eq!(wlan_state(&twif), ClientState::Stopped);
        assert_eq!(elp_writes(&twif), vec![1, 0]);

        // Available without a preceding start wakes up directly.
        twif.hw_available();
        assert_eq!(twif.info().power_state, PowerState::Awake);
        assert_eq!(elp_writes(&twif), vec![1, 0, 1]);
    }

    #[test]
    fn sleeps_once_after_convergence() {
        let twif = twif();
        wake_up(&twif);
        twif.awake();
        let callback_count = Arc::new(Mutex::new(0));
        let counter = callback_count.clone();
        bus(&twif).push_response(TxnStatus::Pending);
        let txn = Txn::write(ClientId::WLAN, Priority::Low, 0x100, vec![0; 16])
            .with_done_cb(Arc::new(move |_: Txn| *counter.lock().unwrap() += 1));
        assert!(twif.submit(txn).is_pending());
        assert_eq!(twif.info().pending_count, 1);

        twif.sleep();
        twif.sleep();
        twif.sleep();
        assert_eq!(twif.info().awake_count, 0);
        assert_eq!(twif.info().power_state, PowerState::Awake);

        assert!(bus(&twif).complete_pending(CompletionStatus::Ok));
        assert_eq!(twif.info().done_queued, 1);
        twif.handle_txn_done();
        assert_eq!(*callback_count.lock().unwrap(), 1);
        assert_eq!(twif.info().pending_count, 0);
        assert_eq!(twif.info().power_state, PowerState::Asleep);

        twif.sleep();
        twif.handle_txn_done();
        assert_eq!(elp_writes(&twif), vec![1, 0]);
    }

    #[test]
    fn submission_while_asleep_wakes_the_device() {
        let twif = twif();
        let txn = Txn::write(ClientId::WLAN, Priority::Low, 0x100, vec![0; 8]);
        let id = txn.id();
        assert!(twif.submit(txn).is_pending());
        assert_eq!(twif.info().power_state, PowerState::WaitHw);
        assert_eq!(elp_writes(&twif), vec![1]);

        twif.hw_available();
        assert!(bus(&twif).sent_ids().contains(&id));
        assert_eq!(twif.info().done_queued, 1);
        block_on(twif.process_txn_done());
        assert_eq!(twif.info().pending_count, 0);
        assert_eq!(twif.info().power_state, PowerState::Asleep);
        assert_eq!(elp_writes(&twif), vec![1, 0]);
    }

    #[test]
    fn synchronous_completion_converges() {
        let twif = twif();
        wake_up(&twif);
        twif.sleep();
        twif.hw_available();
        let txn = Txn::read(ClientId::WLAN, Priority::High, 0x200, 4);
        assert!(matches!(twif.submit(txn), TxnOutcome::Complete(_)));
        let info = twif.info();
        assert_eq!(info.pending_count, 0);
        assert_eq!(info.power_state, PowerState::Asleep);
    }

    #[test]
    fn bus_errors_are_reported() {
        let twif = twif();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        twif.register_error_cb(move |kind| sink.lock().unwrap().push(kind));
        wake_up(&twif);

        bus(&twif).push_response(TxnStatus::Error);
        let txn = Txn::write(ClientId::WLAN, Priority::High, 0x100, vec![0; 4]);
        assert!(matches!(twif.submit(txn), TxnOutcome::Error(_)));
        assert_eq!(*failures.lock().unwrap(), vec![FailureKind::BusFailure]);
        assert_eq!(twif.info().pending_count, 0);

        bus(&twif).push_response(TxnStatus::Pending);
        let txn = Txn::write(ClientId::WLAN, Priority::High, 0x100, vec![0; 4]);
        assert!(twif.submit(txn).is_pending());
        assert!(bus(&twif).complete_pending(CompletionStatus::Error));
        twif.handle_txn_done();
        assert_eq!(failures.lock().unwrap().len(), 2);
        assert_eq!(twif.info().pending_count, 1);
    }

    #[test]
    fn restart_completes_with_txn_in_flight() {
        let twif = twif();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        twif.register_recovery_cb(move |outcome| sink.lock().unwrap().push(outcome));
        wake_up(&twif);

        bus(&twif).push_response(TxnStatus::Pending);
        let in_flight = Txn::write(ClientId::WLAN, Priority::High, 0x100, vec![0; 4]);
        assert!(twif.submit(in_flight).is_pending());
        let queued = Txn::write(ClientId::WLAN, Priority::Low, 0x200, vec![0; 4]);
        assert!(twif.submit(queued).is_pending());

        assert_eq!(twif.restart(), TxnStatus::Pending);
        let info = twif.info();
        assert_eq!(info.power_state, PowerState::Asleep);
        assert_eq!((info.awake_count, info.pending_count), (0, 0));
        assert!(info.restart_pending);

        assert!(bus(&twif).complete_pending(CompletionStatus::Ok));
        assert_eq!(*outcomes.lock().unwrap(), vec![RestartOutcome::Completed]);
        assert_eq!(twif.txn_queue().queued(ClientId::WLAN), 0);
        assert_eq!(wlan_state(&twif), ClientState::Stopped);
        assert_eq!(
            block_on(twif.supervise_restart()),
            Some(RestartOutcome::Completed)
        );
        assert_eq!(block_on(twif.supervise_restart()), None);

        // The guard may still expire later, without effect.
        twif.restart_timeout();
        assert_eq!(outcomes.lock().unwrap().len(), 1);
    }

    #[test]
    fn restart_times_out() {
        let twif = twif();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        twif.register_recovery_cb(move |outcome| sink.lock().unwrap().push(outcome));
        wake_up(&twif);

        bus(&twif).push_response(TxnStatus::Pending);
        let in_flight = Txn::write(ClientId::WLAN, Priority::High, 0x100, vec![0; 4]);
        assert!(twif.submit(in_flight).is_pending());
        let queued = Txn::write(ClientId::WLAN, Priority::Low, 0x200, vec![0; 4]);
        assert!(twif.submit(queued).is_pending());
        assert_eq!(twif.restart(), TxnStatus::Pending);

        twif.restart_timeout();
        assert_eq!(*outcomes.lock().unwrap(), vec![RestartOutcome::TimedOut]);
        assert_eq!(twif.txn_queue().queued(ClientId::WLAN), 0);
        assert_eq!(wlan_state(&twif), ClientState::Stopped);

        // The straggler doesn't finish the restart a second time.
        assert!(bus(&twif).complete_pending(CompletionStatus::Ok));
        assert_eq!(outcomes.lock().unwrap().len(), 1);
        assert_eq!(
            block_on(twif.supervise_restart()),
            Some(RestartOutcome::TimedOut)
        );
    }

    #[test]
    fn timed_out_restart_keeps_the_bus_until_the_straggler_returns() {
        let twif = twif();
        wake_up(&twif);
        let (bt_delivered, bt_cb) = {
            let delivered = Arc::new(Mutex::new(Vec::new()));
            let sink = delivered.clone();
            let bt_cb: TxnDoneCb = Arc::new(move |txn: Txn| sink.lock().unwrap().push(txn.id()));
            (delivered, bt_cb)
        };
        twif.txn_queue().open(ClientId::BT, 1, bt_cb).unwrap();
        twif.txn_queue().run(ClientId::BT).unwrap();

        bus(&twif).push_response(TxnStatus::Pending);
        let straggler = Txn::write(ClientId::WLAN, Priority::High, 0x100, vec![0; 4]);
        assert!(twif.submit(straggler).is_pending());
        assert_eq!(twif.restart(), TxnStatus::Pending);
        twif.restart_timeout();

        bus(&twif).set_default_response(TxnStatus::Pending);
        let bt = Txn::write(ClientId::BT, Priority::High, 0, vec![0; 4]);
        let bt_id = bt.id();
        assert!(twif.txn_queue().submit(bt).is_pending());
        assert_eq!(bus(&twif).pending_count(), 1);
        assert!(!bus(&twif).sent_ids().contains(&bt_id));

        assert!(bus(&twif).complete_pending(CompletionStatus::Ok));
        assert_eq!(twif.info().done_queued, 0);
        assert_eq!(bus(&twif).sent_ids().last(), Some(&bt_id));
        assert!(bus(&twif).complete_pending(CompletionStatus::Ok));
        assert_eq!(*bt_delivered.lock().unwrap(), vec![bt_id]);
        assert_eq!(bus(&twif).max_in_flight(), 1);
    }

    #[test]
    fn restart_guard_expires() {
        let twif = TwIf::new(
            MockBus::new(),
            TwIfConfig {
                restart_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        twif.register_recovery_cb(move |outcome| sink.lock().unwrap().push(outcome));
        wake_up(&twif);

        bus(&twif).push_response(TxnStatus::Pending);
        let in_flight = Txn::write(ClientId::WLAN, Priority::High, 0x100, vec![0; 4]);
        assert!(twif.submit(in_flight).is_pending());
        let queued = Txn::write(ClientId::WLAN, Priority::Low, 0x200, vec![0; 4]);
        assert!(twif.submit(queued).is_pending());
        assert_eq!(twif.restart(), TxnStatus::Pending);

        assert_eq!(
            block_on(twif.supervise_restart()),
            Some(RestartOutcome::TimedOut)
        );
        assert_eq!(*outcomes.lock().unwrap(), vec![RestartOutcome::TimedOut]);
        assert_eq!(twif.txn_queue().queued(ClientId::WLAN), 0);
        assert_eq!(wlan_state(&twif), ClientState::Stopped);
        assert!(!twif.info().restart_pending);
    }

    #[test]
    fn error_leaves_remaining_completions_signalled() {
        let twif = twif();
        twif.register_error_cb(|_| {});
        wake_up(&twif);
        let callback_count = Arc::new(Mutex::new(0));
        let counter = callback_count.clone();

        bus(&twif).set_default_response(TxnStatus::Pending);
        let failing = Txn::write(ClientId::WLAN, Priority::High, 0x100, vec![0; 4]);
        let succeeding = Txn::write(ClientId::WLAN, Priority::High, 0x200, vec![0; 4])
            .with_done_cb(Arc::new(move |_: Txn| *counter.lock().unwrap() += 1));
        assert!(twif.submit(failing).is_pending());
        assert!(twif.submit(succeeding).is_pending());
        assert!(bus(&twif).complete_pending(CompletionStatus::Error));
        assert!(bus(&twif).complete_pending(CompletionStatus::Ok));
        assert_eq!(twif.info().done_queued, 2);

        block_on(twif.process_txn_done());
        assert_eq!(twif.info().done_queued, 1);
        assert_eq!(*callback_count.lock().unwrap(), 0);
        block_on(twif.process_txn_done());
        assert_eq!(twif.info().done_queued, 0);
        assert_eq!(*callback_count.lock().unwrap(), 1);
        assert_eq!(twif.info().pending_count, 1);
    }

    #[test]
    fn restart_without_txn_in_flight() {
        let twif = twif();
        wake_up(&twif);
        twif.txn_queue().stop(ClientId::WLAN).unwrap();
        let txn = Txn::write(ClientId::WLAN, Priority::Low, 0x100, vec![0; 4]);
        assert!(twif.submit(txn).is_pending());
        assert_eq!(twif.restart(), TxnStatus::Complete);
        assert_eq!(twif.txn_queue().queued(ClientId::WLAN), 0);
        assert_eq!(wlan_state(&twif), ClientState::Stopped);
        assert!(!twif.info().restart_pending);
        assert_eq!(block_on(twif.supervise_restart()), None);
    }

    #[test]
    fn partitions_are_written_and_used_for_translation() {
        let twif = twif();
        wake_up(&twif);
        bus(&twif).clear_sent();
        let partitions = [
            Partition {
                addr: 0x40000,
                size: 0x14fc0,
            },
            Partition {
                addr: 0x300000,
                size: 0x8800,
            },
            Partition {
                addr: 0x3004f8,
                size: 0x4,
            },
            Partition {
                addr: 0x40404,
                size: 0,
            },
        ];
        assert_eq!(twif.set_partition(&partitions), TxnStatus::Complete);
        let sent = bus(&twif).sent();
        assert_eq!(sent.len(), 7);
        let expected = [
            0x40000u32, 0x14fc0, 0x300000, 0x8800, 0x3004f8, 0x4, 0x40404,
        ];
        for (index, (sent, value)) in sent.iter().zip(expected).enumerate() {
            assert_eq!(sent.hw_addr, 0x1ffc0 + index as u32 * 4);
            assert_eq!(sent.priority, Priority::Low);
            assert_eq!(sent.data, value.to_le_bytes());
        }

        bus(&twif).clear_sent();
        twif.submit(Txn::write(ClientId::WLAN, Priority::High, 0x300010, vec![0; 4]));
        twif.submit(Txn::write(ClientId::WLAN, Priority::High, 0x40100, vec![0; 4]));
        let addrs: Vec<u32> = bus(&twif).sent().iter().map(|sent| sent.hw_addr).collect();
        assert_eq!(addrs, vec![0x14fd0, 0x100]);
    }

    #[test]
    fn fw_status_read_marks_device_available() {
        let twif = twif();
        let txn = Txn::read(ClientId::WLAN, Priority::Low, 0x804, 4);
        let id = txn.id();
        assert!(matches!(
            twif.submit_read_fw_status(txn),
            TxnOutcome::Complete(_)
        ));
        let sent = bus(&twif).sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].data, vec![1]);
        assert_eq!(sent[1].id, id);
        assert_eq!(sent[1].priority, Priority::High);
        assert_eq!(sent[2].data, vec![0]);
        assert_eq!(twif.info().power_state, PowerState::Asleep);
    }

    #[test]
    fn drop_closes_the_client() {
        let twif = twif();
        let txn_queue = twif.txn_queue().clone();
        assert_eq!(txn_queue.client_state(ClientId::WLAN), ClientState::Stopped);
        drop(twif);
        assert_eq!(
            txn_queue.client_state(ClientId::WLAN),
            ClientState::NotRegistered
        );
    }
}
