use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex;

use crate::{
    ClientId, CompletionStatus, DefaultRawMutex, Direction, Txn, TxnDoneCb, TxnOutcome, TxnStatus,
};

/// The physical bus, as seen by the scheduler.
///
/// Only one transaction is handed to the transport at a time.
pub trait BusTransport {
    /// Connect the callback used for returning transactions, that finished asynchronously.
    fn connect(&self, done_cb: TxnDoneCb);
    /// Perform the transfer described by `txn`.
    ///
    /// If [TxnOutcome::Pending] is returned, the transport keeps the transaction and must return
    /// it exactly once through the connected callback, possibly from another context.
    fn transact(&self, txn: Txn) -> TxnOutcome;
}

/// A single primitive transfer on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartRequest {
    /// The bus function the transfer targets.
    pub function: ClientId,
    pub hw_addr: u32,
    pub direction: Direction,
    /// Transfer in block mode instead of byte mode.
    pub block_mode: bool,
    pub fixed_addr: bool,
    /// More data follows this transfer.
    pub more: bool,
}

/// The host controller adapter, which performs the primitive transfers for a [BusDrv].
pub trait BusAdapter {
    /// Start a primitive transfer.
    ///
    /// If [TxnStatus::Pending] is returned, the adapter must report the transfer exactly once
    /// through [BusDrv::part_done], passing the received data for reads. This may happen before
    /// this function returns.
    fn transfer(&self, request: &PartRequest, data: &mut [u8]) -> TxnStatus;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Parameters of a [BusDrv].
pub struct BusDrvConfig {
    /// The block size of the bus. Zero disables block mode.
    pub block_size: usize,
    /// The capacity of the aggregation buffer.
    pub max_aggregate_len: usize,
    /// Retry a failed single step transaction once.
    ///
    /// Some devices drop the first ELP write after waking up.
    pub retry_single_step: bool,
}
impl Default for BusDrvConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            max_aggregate_len: 8192,
            retry_single_step: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum PartSource {
    Buf { index: usize, offset: usize },
    Aggregate { offset: usize },
}
#[derive(Clone, Copy, Debug)]
struct TxnPart {
    request: PartRequest,
    source: PartSource,
    len: usize,
}

/// The transaction currently on the bus, split into parts.
struct CurrTxn {
    txn: Txn,
    parts: Vec<TxnPart>,
    next_part: usize,
    /// The flushed aggregation buffer, if this transaction closed a burst.
    aggregate: Vec<u8>,
    retried: bool,
}
impl CurrTxn {
    fn data_mut(&mut self, part: &TxnPart) -> &mut [u8] {
        match part.source {
            PartSource::Buf { index, offset } => {
                &mut self.txn.buf_mut(index)[offset..offset + part.len]
            }
            PartSource::Aggregate { offset } => &mut self.aggregate[offset..offset + part.len],
        }
    }
}

/// An open write burst.
struct Burst {
    client: ClientId,
    hw_addr: u32,
    data: Vec<u8>,
}

/// A part completion, that arrived before the sender parked the transaction.
struct EarlyCompletion {
    ok: bool,
    data: Vec<u8>,
}

#[derive(Default)]
struct BusDrvState {
    curr: Option<CurrTxn>,
    part_outstanding: bool,
    early: Option<EarlyCompletion>,
    burst: Option<Burst>,
    done_cb: Option<TxnDoneCb>,
}

enum Prepared {
    Send(CurrTxn),
    Buffered(Txn),
    Rejected(Txn),
}

/// Bus driver, which splits transactions into primitive transfers for a [BusAdapter].
pub struct BusDrv<A> {
    adapter: A,
    config: BusDrvConfig,
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<BusDrvState>>,
}
impl<A: BusAdapter> BusDrv<A> {
    pub fn new(adapter: A, config: BusDrvConfig) -> Self {
        debug!(
            "Bus driver created. Block size: {} Aggregation buffer: {}",
            config.block_size,
            config.max_aggregate_len
        );
        Self {
            adapter,
            config,
            state: blocking_mutex::Mutex::new(RefCell::new(BusDrvState::default())),
        }
    }
    pub fn adapter(&self) -> &A {
        &self.adapter
    }
    pub fn config(&self) -> &BusDrvConfig {
        &self.config
    }
    /// Check if a write burst is currently being aggregated.
    pub fn is_burst_open(&self) -> bool {
        self.state.lock(|state| state.borrow().burst.is_some())
    }
    /// Append the parts for `len` bytes starting at `hw_addr`.
    ///
    /// The bytes are split into a block mode part and a byte mode remainder.
    fn push_parts(
        &self,
        parts: &mut Vec<TxnPart>,
        template: PartRequest,
        hw_addr: &mut u32,
        len: usize,
        allow_block: bool,
        source: impl Fn(usize) -> PartSource,
    ) {
        let block_len = if self.config.block_size > 0 && allow_block {
            len - len % self.config.block_size
        } else {
            0
        };
        let mut offset = 0;
        for (part_len, block_mode) in [(block_len, true), (len - block_len, false)] {
            if part_len == 0 {
                continue;
            }
            parts.push(TxnPart {
                request: PartRequest {
                    hw_addr: *hw_addr,
                    block_mode,
                    ..template
                },
                source: source(offset),
                len: part_len,
            });
            if !template.fixed_addr {
                *hw_addr = hw_addr.wrapping_add(part_len as u32);
            }
            offset += part_len;
        }
    }
    /// Split a transaction, which doesn't take part in a burst.
    fn split(&self, txn: Txn) -> CurrTxn {
        // Single step transactions always go to the control function in byte mode.
        let template = PartRequest {
            function: if txn.is_single_step() {
                ClientId::CTRL
            } else {
                txn.client()
            },
            hw_addr: txn.hw_addr(),
            direction: txn.direction(),
            block_mode: false,
            fixed_addr: txn.is_fixed_addr(),
            more: true,
        };
        let mut parts = Vec::new();
        let mut hw_addr = txn.hw_addr();
        for (index, buf) in txn.bufs().enumerate() {
            self.push_parts(
                &mut parts,
                template,
                &mut hw_addr,
                buf.len(),
                !txn.is_single_step(),
                |offset| PartSource::Buf { index, offset },
            );
        }
        Self::finish_parts(&mut parts, &txn);
        CurrTxn {
            txn,
            parts,
            next_part: 0,
            aggregate: Vec::new(),
            retried: false,
        }
    }
    /// Split a flushed burst, that is closed by `txn`.
    fn split_burst(&self, txn: Txn, burst: Burst) -> CurrTxn {
        let template = PartRequest {
            function: burst.client,
            hw_addr: burst.hw_addr,
            direction: Direction::Write,
            block_mode: false,
            fixed_addr: false,
            more: true,
        };
        let mut parts = Vec::new();
        let mut hw_addr = burst.hw_addr;
        self.push_parts(
            &mut parts,
            template,
            &mut hw_addr,
            burst.data.len(),
            true,
            |offset| PartSource::Aggregate { offset },
        );
        Self::finish_parts(&mut parts, &txn);
        CurrTxn {
            txn,
            parts,
            next_part: 0,
            aggregate: burst.data,
            retried: false,
        }
    }
    /// The last part carries the more flag of the transaction itself.
    fn finish_parts(parts: &mut [TxnPart], txn: &Txn) {
        if let Some(last) = parts.last_mut() {
            last.request.more = txn.more();
        }
    }
    fn append_to_burst(burst: &mut Burst, txn: &Txn) {
        for buf in txn.bufs() {
            burst.data.extend_from_slice(buf);
        }
    }
    /// Decide what to do with a new transaction, taking an open burst into account.
    fn prepare(&self, txn: Txn) -> Prepared {
        let burst = self.state.lock(|state| state.borrow_mut().burst.take());
        if txn.hw_addr() & 0x3 != 0 {
            error!(
                "Txn {} has unaligned address {:x}.",
                txn.id().0,
                txn.hw_addr()
            );
            if let Some(burst) = burst {
                error!(
                    "Discarding {} aggregated bytes of client {}.",
                    burst.data.len(),
                    burst.client.0
                );
            }
            return Prepared::Rejected(txn);
        }
        if let Some(mut burst) = burst {
            if !txn.is_write()
                || txn.is_fixed_addr()
                || txn.is_single_step()
                || txn.client() != burst.client
            {
                error!(
                    "Txn {} violates the open burst of client {}. Discarding {} aggregated bytes.",
                    txn.id().0,
                    burst.client.0,
                    burst.data.len()
                );
                return Prepared::Rejected(txn);
            }
            if burst.data.len() + txn.total_len() > self.config.max_aggregate_len {
                error!(
                    "Aggregation buffer overflow by txn {}. Discarding {} aggregated bytes.",
                    txn.id().0,
                    burst.data.len()
                );
                return Prepared::Rejected(txn);
            }
            Self::append_to_burst(&mut burst, &txn);
            if txn.is_aggregate() {
                trace!("Txn {} appended to burst.", txn.id().0);
                self.state
                    .lock(|state| state.borrow_mut().burst = Some(burst));
                return Prepared::Buffered(txn);
            }
            trace!("Txn {} closes burst of {} bytes.", txn.id().0, burst.data.len());
            return Prepared::Send(self.split_burst(txn, burst));
        }
        if txn.is_aggregate() {
            if !txn.is_write() || txn.is_fixed_addr() || txn.is_single_step() {
                error!(
                    "Aggregation isn't supported for txn {}, which is a read, fixed address or single step.",
                    txn.id().0
                );
                return Prepared::Rejected(txn);
            }
            if txn.total_len() > self.config.max_aggregate_len {
                error!("Txn {} doesn't fit into the aggregation buffer.", txn.id().0);
                return Prepared::Rejected(txn);
            }
            let mut burst = Burst {
                client: txn.client(),
                hw_addr: txn.hw_addr(),
                data: Vec::with_capacity(self.config.max_aggregate_len),
            };
            Self::append_to_burst(&mut burst, &txn);
            trace!("Txn {} opens a burst.", txn.id().0);
            self.state
                .lock(|state| state.borrow_mut().burst = Some(burst));
            return Prepared::Buffered(txn);
        }
        Prepared::Send(self.split(txn))
    }
    /// Store the result of the last sent part. Returns `false` if it failed.
    fn complete_part(curr: &mut CurrTxn, ok: bool, read_data: &[u8]) -> bool {
        let part = curr.parts[curr.next_part - 1];
        if ok && part.request.direction == Direction::Read {
            let data = curr.data_mut(&part);
            let len = data.len().min(read_data.len());
            data[..len].copy_from_slice(&read_data[..len]);
        }
        ok
    }
    fn fail(mut curr: CurrTxn) -> TxnOutcome {
        curr.txn.set_status(CompletionStatus::Error);
        TxnOutcome::Error(curr.txn)
    }
    /// Send the remaining parts of the transaction.
    ///
    /// Returns [None], if a part is pending. The transaction is then parked until
    /// [Self::part_done] is called.
    fn send_parts(&self, mut curr: CurrTxn) -> Option<TxnOutcome> {
        loop {
            let Some(part) = curr.parts.get(curr.next_part).copied() else {
                curr.txn.set_status(CompletionStatus::Ok);
                return Some(TxnOutcome::Complete(curr.txn));
            };
            curr.next_part += 1;
            self.state
                .lock(|state| state.borrow_mut().part_outstanding = true);
            let mut status = self.adapter.transfer(&part.request, curr.data_mut(&part));
            if status == TxnStatus::Error
                && self.config.retry_single_step
                && curr.txn.is_single_step()
                && !curr.retried
            {
                warn!("Single step txn {} failed. Retrying once.", curr.txn.id().0);
                curr.retried = true;
                status = self.adapter.transfer(&part.request, curr.data_mut(&part));
            }
            match status {
                TxnStatus::Complete => {
                    self.state
                        .lock(|state| state.borrow_mut().part_outstanding = false);
                }
                TxnStatus::Error => {
                    self.state
                        .lock(|state| state.borrow_mut().part_outstanding = false);
                    error!(
                        "Part {} of txn {} failed at {:x}.",
                        curr.next_part - 1,
                        curr.txn.id().0,
                        part.request.hw_addr
                    );
                    return Some(Self::fail(curr));
                }
                TxnStatus::Pending => {
                    // The completion may already have arrived, in which case we continue here.
                    let parked = self.state.lock(|state| {
                        let mut state = state.borrow_mut();
                        match state.early.take() {
                            Some(early) => Err((curr, early)),
                            None => {
                                state.curr = Some(curr);
                                Ok(())
                            }
                        }
                    });
                    match parked {
                        Ok(()) => return None,
                        Err((returned, early)) => {
                            curr = returned;
                            if !Self::complete_part(&mut curr, early.ok, &early.data) {
                                return Some(Self::fail(curr));
                            }
                        }
                    }
                }
            }
        }
    }
    /// Report the completion of a pending part.
    ///
    /// This is called by the adapter, usually from interrupt context. For reads `read_data`
    /// holds the received bytes.
    pub fn part_done(&self, ok: bool, read_data: &[u8]) {
        let curr = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.part_outstanding {
                return Err(());
            }
            state.part_outstanding = false;
            match state.curr.take() {
                Some(curr) => Ok(Some(curr)),
                None => {
                    state.early = Some(EarlyCompletion {
                        ok,
                        data: read_data.to_vec(),
                    });
                    Ok(None)
                }
            }
        });
        let mut curr = match curr {
            Ok(Some(curr)) => curr,
            Ok(None) => return,
            Err(()) => {
                warn!("Part completion without an outstanding part. Ignoring.");
                return;
            }
        };
        let outcome = if Self::complete_part(&mut curr, ok, read_data) {
            self.send_parts(curr)
        } else {
            error!("Pending part of txn {} failed.", curr.txn.id().0);
            Some(Self::fail(curr))
        };
        if let Some(txn) = outcome.and_then(TxnOutcome::into_txn) {
            self.deliver(txn);
        }
    }
    /// Return an asynchronously finished transaction.
    fn deliver(&self, txn: Txn) {
        match self.state.lock(|state| state.borrow().done_cb.clone()) {
            Some(done_cb) => done_cb(txn),
            None => error!("No done callback connected. Dropping txn {}.", txn.id().0),
        }
    }
}
impl<A: BusAdapter> BusTransport for BusDrv<A> {
    fn connect(&self, done_cb: TxnDoneCb) {
        self.state
            .lock(|state| state.borrow_mut().done_cb = Some(done_cb));
    }
    fn transact(&self, txn: Txn) -> TxnOutcome {
        match self.prepare(txn) {
            Prepared::Buffered(mut txn) => {
                txn.set_status(CompletionStatus::Ok);
                TxnOutcome::Complete(txn)
            }
            Prepared::Rejected(mut txn) => {
                txn.set_status(CompletionStatus::Error);
                TxnOutcome::Error(txn)
            }
            Prepared::Send(curr) => self.send_parts(curr).unwrap_or(TxnOutcome::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::{
        sync::{Arc, Weak},
        vec,
        vec::Vec,
    };
    use std::sync::Mutex;

    use super::*;
    use crate::{mock::MockAdapter, AddrMode, Priority};

    fn bus_drv(config: BusDrvConfig) -> BusDrv<MockAdapter> {
        BusDrv::new(MockAdapter::new(), config)
    }
    fn collect_done(bus: &BusDrv<MockAdapter>) -> Arc<Mutex<Vec<Txn>>> {
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        bus.connect(Arc::new(move |txn: Txn| sink.lock().unwrap().push(txn)));
        done
    }

    #[test]
    fn unaligned_address_is_rejected() {
        let bus = bus_drv(BusDrvConfig::default());
        let txn = Txn::write(ClientId::WLAN, Priority::High, 0x1002, vec![0; 4]);
        let TxnOutcome::Error(txn) = bus.transact(txn) else {
            panic!("unaligned txn wasn't rejected");
        };
        assert_eq!(txn.status(), CompletionStatus::Error);
        assert!(bus.adapter().requests().is_empty());
    }

    #[test]
    fn unaligned_address_discards_open_burst() {
        let bus = bus_drv(BusDrvConfig::default());
        let first = Txn::write(ClientId::WLAN, Priority::Low, 0x8000, vec![1; 8]).with_aggregate(true);
        assert!(matches!(bus.transact(first), TxnOutcome::Complete(_)));
        assert!(bus.is_burst_open());
        let unaligned = Txn::write(ClientId::WLAN, Priority::Low, 0x8002, vec![2; 8]);
        assert!(matches!(bus.transact(unaligned), TxnOutcome::Error(_)));
        assert!(!bus.is_burst_open());
        assert!(bus.adapter().requests().is_empty());
    }

    #[test]
    fn large_transfer_is_split_into_block_and_remainder() {
        let bus = bus_drv(BusDrvConfig::default());
        let txn = Txn::read(ClientId::WLAN, Priority::Low, 0x4000, 1100);
        let TxnOutcome::Complete(txn) = bus.transact(txn) else {
            panic!("read didn't complete");
        };
        let requests = bus.adapter().requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].hw_addr, 0x4000);
        assert!(requests[0].block_mode);
        assert!(requests[0].more);
        assert_eq!(requests[1].hw_addr, 0x4000 + 1024);
        assert!(!requests[1].block_mode);
        assert!(!requests[1].more);
        assert_eq!(bus.adapter().lengths(), vec![1024, 76]);
        assert!(txn.buf(0).unwrap().iter().all(|byte| *byte == MockAdapter::READ_FILL));
    }

    #[test]
    fn fixed_address_does_not_advance() {
        let bus = bus_drv(BusDrvConfig::default());
        let txn = Txn::write(ClientId::WLAN, Priority::High, 0x100, vec![1; 600])
            .with_addr_mode(AddrMode::Fixed);
        assert!(matches!(bus.transact(txn), TxnOutcome::Complete(_)));
        let requests = bus.adapter().requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|request| request.hw_addr == 0x100));
    }

    #[test]
    fn burst_is_flushed_as_one_write() {
        let bus = bus_drv(BusDrvConfig::default());
        let first = Txn::write(ClientId::WLAN, Priority::Low, 0x8000, vec![1; 8]).with_aggregate(true);
        let second =
            Txn::write(ClientId::WLAN, Priority::Low, 0x8000, vec![2; 8]).with_aggregate(true);
        let last = Txn::write(ClientId::WLAN, Priority::Low, 0x8000, vec![3; 8]);
        assert!(matches!(bus.transact(first), TxnOutcome::Complete(_)));
        assert!(matches!(bus.transact(second), TxnOutcome::Complete(_)));
        assert!(bus.is_burst_open());
        assert!(bus.adapter().requests().is_empty());
        assert!(matches!(bus.transact(last), TxnOutcome::Complete(_)));
        assert!(!bus.is_burst_open());
        let writes = bus.adapter().written();
        assert_eq!(writes.len(), 1);
        let mut expected = vec![1; 8];
        expected.extend_from_slice(&[2; 8]);
        expected.extend_from_slice(&[3; 8]);
        assert_eq!(writes[0], expected);
        assert_eq!(bus.adapter().requests()[0].hw_addr, 0x8000);
    }

    #[test]
    fn read_inside_burst_is_a_violation() {
        let bus = bus_drv(BusDrvConfig::default());
        let first = Txn::write(ClientId::WLAN, Priority::Low, 0x8000, vec![1; 8]).with_aggregate(true);
        assert!(matches!(bus.transact(first), TxnOutcome::Complete(_)));
        let read = Txn::read(ClientId::WLAN, Priority::Low, 0x8000, 8);
        assert!(matches!(bus.transact(read), TxnOutcome::Error(_)));
        assert!(!bus.is_burst_open());
        assert!(bus.adapter().requests().is_empty());
    }

    #[test]
    fn burst_overflow_is_rejected() {
        let bus = bus_drv(BusDrvConfig {
            max_aggregate_len: 16,
            ..Default::default()
        });
        let first = Txn::write(ClientId::WLAN, Priority::Low, 0, vec![0; 12]).with_aggregate(true);
        assert!(matches!(bus.transact(first), TxnOutcome::Complete(_)));
        let second = Txn::write(ClientId::WLAN, Priority::Low, 0, vec![0; 12]);
        assert!(matches!(bus.transact(second), TxnOutcome::Error(_)));
        assert!(!bus.is_burst_open());
    }

    #[test]
    fn pending_parts_continue_from_completion() {
        let bus = bus_drv(BusDrvConfig::default());
        let done = collect_done(&bus);
        bus.adapter().push_response(TxnStatus::Pending);
        let txn = Txn::read(ClientId::WLAN, Priority::High, 0x200, 1030);
        let id = txn.id();
        assert!(bus.transact(txn).is_pending());
        assert_eq!(bus.adapter().requests().len(), 1);

        bus.part_done(true, &[0x11; 1024]);
        assert_eq!(bus.adapter().requests().len(), 2);
        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id(), id);
        assert_eq!(done[0].status(), CompletionStatus::Ok);
        assert_eq!(done[0].buf(0).unwrap()[0], 0x11);
        assert_eq!(done[0].buf(0).unwrap()[1029], MockAdapter::READ_FILL);
    }

    #[test]
    fn failed_pending_part_is_reported() {
        let bus = bus_drv(BusDrvConfig::default());
        let done = collect_done(&bus);
        bus.adapter().push_response(TxnStatus::Pending);
        let txn = Txn::write(ClientId::WLAN, Priority::High, 0x200, vec![0; 4]);
        assert!(bus.transact(txn).is_pending());
        bus.part_done(false, &[]);
        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status(), CompletionStatus::Error);
    }

    /// Reports every transfer through [BusDrv::part_done], before returning from it.
    struct EarlyAdapter {
        bus: std::sync::OnceLock<Weak<BusDrv<EarlyAdapter>>>,
    }
    impl BusAdapter for EarlyAdapter {
        fn transfer(&self, _request: &PartRequest, data: &mut [u8]) -> TxnStatus {
            let bus = self.bus.get().and_then(Weak::upgrade).unwrap();
            bus.part_done(true, &vec![0x77; data.len()]);
            TxnStatus::Pending
        }
    }

    #[test]
    fn completion_before_transfer_returns() {
        let bus = Arc::new(BusDrv::new(
            EarlyAdapter {
                bus: std::sync::OnceLock::new(),
            },
            BusDrvConfig::default(),
        ));
        bus.adapter().bus.set(Arc::downgrade(&bus)).unwrap();
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        bus.connect(Arc::new(move |txn: Txn| sink.lock().unwrap().push(txn.id())));

        let txn = Txn::read(ClientId::WLAN, Priority::High, 0x200, 1100);
        let TxnOutcome::Complete(txn) = bus.transact(txn) else {
            panic!("early completions weren't picked up");
        };
        assert!(txn.buf(0).unwrap().iter().all(|byte| *byte == 0x77));
        assert!(done.lock().unwrap().is_empty());
    }

    #[test]
    fn stray_completion_is_ignored() {
        let bus = bus_drv(BusDrvConfig::default());
        let done = collect_done(&bus);
        bus.part_done(true, &[]);
        let txn = Txn::write(ClientId::WLAN, Priority::High, 0x200, vec![0; 4]);
        assert!(matches!(bus.transact(txn), TxnOutcome::Complete(_)));
        assert!(done.lock().unwrap().is_empty());
    }

    #[test]
    fn single_step_goes_to_control_function_and_retries() {
        let bus = bus_drv(BusDrvConfig {
            retry_single_step: true,
            ..Default::default()
        });
        bus.adapter().push_response(TxnStatus::Error);
        let txn = Txn::write(ClientId::WLAN, Priority::High, 0x1fffc, vec![1])
            .with_single_step(true);
        assert!(matches!(bus.transact(txn), TxnOutcome::Complete(_)));
        let requests = bus.adapter().requests();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|request| request.function == ClientId::CTRL && !request.block_mode));
    }

    #[test]
    fn single_step_failure_without_retry() {
        let bus = bus_drv(BusDrvConfig::default());
        bus.adapter().push_response(TxnStatus::Error);
        let txn = Txn::write(ClientId::WLAN, Priority::High, 0x1fffc, vec![1])
            .with_single_step(true);
        assert!(matches!(bus.transact(txn), TxnOutcome::Error(_)));
        assert_eq!(bus.adapter().requests().len(), 1);
    }
}
