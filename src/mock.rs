//! Mock bus backends for host side tests.
//!
//! [MockBus] stands in for a whole [BusTransport] and is used for testing the scheduler and the
//! power state machine. [MockAdapter] stands in for a host controller below a
//! [BusDrv](crate::BusDrv).

use alloc::{collections::VecDeque, vec::Vec};
use core::cell::RefCell;

use embassy_sync::blocking_mutex;

use crate::{
    BusAdapter, BusTransport, ClientId, CompletionStatus, DefaultRawMutex, Direction, PartRequest,
    Priority, Txn, TxnDoneCb, TxnId, TxnOutcome, TxnStatus,
};

/// A transaction, as it was seen by the [MockBus].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTxn {
    pub id: TxnId,
    pub client: ClientId,
    pub priority: Priority,
    pub direction: Direction,
    pub hw_addr: u32,
    pub single_step: bool,
    pub aggregate: bool,
    /// The contents of all buffers, concatenated.
    pub data: Vec<u8>,
}

struct MockBusState {
    responses: VecDeque<TxnStatus>,
    default_response: TxnStatus,
    sent: Vec<SentTxn>,
    pending: VecDeque<Txn>,
    max_in_flight: usize,
    done_cb: Option<TxnDoneCb>,
}

/// A [BusTransport], which records every transaction and answers with scripted statuses.
pub struct MockBus {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<MockBusState>>,
}
impl MockBus {
    /// The value read transactions are filled with.
    pub const READ_FILL: u8 = 0xa5;

    /// Create a bus, which completes everything synchronously.
    pub fn new() -> Self {
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(MockBusState {
                responses: VecDeque::new(),
                default_response: TxnStatus::Complete,
                sent: Vec::new(),
                pending: VecDeque::new(),
                max_in_flight: 0,
                done_cb: None,
            })),
        }
    }
    /// Set the status used, once the scripted responses are exhausted.
    pub fn set_default_response(&self, status: TxnStatus) {
        self.state
            .lock(|state| state.borrow_mut().default_response = status);
    }
    /// Script the status of the next transaction.
    pub fn push_response(&self, status: TxnStatus) {
        self.state
            .lock(|state| state.borrow_mut().responses.push_back(status));
    }
    pub fn sent(&self) -> Vec<SentTxn> {
        self.state.lock(|state| state.borrow().sent.clone())
    }
    pub fn sent_ids(&self) -> Vec<TxnId> {
        self.state
            .lock(|state| state.borrow().sent.iter().map(|sent| sent.id).collect())
    }
    pub fn clear_sent(&self) {
        self.state.lock(|state| state.borrow_mut().sent.clear());
    }
    /// The number of transactions, that returned [TxnStatus::Pending] and weren't completed yet.
    pub fn pending_count(&self) -> usize {
        self.state.lock(|state| state.borrow().pending.len())
    }
    /// The highest number of transactions, that were on the bus at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock(|state| state.borrow().max_in_flight)
    }
    /// Take the oldest pending transaction out of the bus without completing it.
    pub fn take_pending(&self, status: CompletionStatus) -> Option<Txn> {
        let mut txn = self
            .state
            .lock(|state| state.borrow_mut().pending.pop_front())?;
        txn.set_status(status);
        Some(txn)
    }
    /// Complete the oldest pending transaction through the connected done callback.
    ///
    /// Returns `false`, if nothing was pending or nothing is connected.
    pub fn complete_pending(&self, status: CompletionStatus) -> bool {
        let done_cb = self.state.lock(|state| state.borrow().done_cb.clone());
        let Some(done_cb) = done_cb else {
            return false;
        };
        let Some(txn) = self.take_pending(status) else {
            return false;
        };
        done_cb(txn);
        true
    }
}
impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}
impl BusTransport for MockBus {
    fn connect(&self, done_cb: TxnDoneCb) {
        self.state
            .lock(|state| state.borrow_mut().done_cb = Some(done_cb));
    }
    fn transact(&self, mut txn: Txn) -> TxnOutcome {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.sent.push(SentTxn {
                id: txn.id(),
                client: txn.client(),
                priority: txn.priority(),
                direction: txn.direction(),
                hw_addr: txn.hw_addr(),
                single_step: txn.is_single_step(),
                aggregate: txn.is_aggregate(),
                data: txn.bufs().flatten().copied().collect(),
            });
            let in_flight = state.pending.len() + 1;
            state.max_in_flight = state.max_in_flight.max(in_flight);
            let status = state
                .responses
                .pop_front()
                .unwrap_or(state.default_response);
            match status {
                TxnStatus::Complete => {
                    if !txn.is_write() {
                        for index in 0..txn.buf_count() {
                            txn.buf_mut(index).fill(Self::READ_FILL);
                        }
                    }
                    txn.set_status(CompletionStatus::Ok);
                    TxnOutcome::Complete(txn)
                }
                TxnStatus::Error => {
                    txn.set_status(CompletionStatus::Error);
                    TxnOutcome::Error(txn)
                }
                TxnStatus::Pending => {
                    state.pending.push_back(txn);
                    TxnOutcome::Pending
                }
            }
        })
    }
}

struct MockAdapterState {
    responses: VecDeque<TxnStatus>,
    requests: Vec<PartRequest>,
    lengths: Vec<usize>,
    written: Vec<Vec<u8>>,
}

/// A [BusAdapter], which records every primitive transfer.
///
/// Read transfers are filled with [MockAdapter::READ_FILL]. Pending transfers have to be
/// completed through [BusDrv::part_done](crate::BusDrv::part_done).
pub struct MockAdapter {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<MockAdapterState>>,
}
impl MockAdapter {
    pub const READ_FILL: u8 = 0x5a;

    pub fn new() -> Self {
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(MockAdapterState {
                responses: VecDeque::new(),
                requests: Vec::new(),
                lengths: Vec::new(),
                written: Vec::new(),
            })),
        }
    }
    /// Script the status of the next transfer. Unscripted transfers complete.
    pub fn push_response(&self, status: TxnStatus) {
        self.state
            .lock(|state| state.borrow_mut().responses.push_back(status));
    }
    pub fn requests(&self) -> Vec<PartRequest> {
        self.state.lock(|state| state.borrow().requests.clone())
    }
    pub fn lengths(&self) -> Vec<usize> {
        self.state.lock(|state| state.borrow().lengths.clone())
    }
    /// The data of all write transfers.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock(|state| state.borrow().written.clone())
    }
}
impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}
impl BusAdapter for MockAdapter {
    fn transfer(&self, request: &PartRequest, data: &mut [u8]) -> TxnStatus {
        let status = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.requests.push(*request);
            state.lengths.push(data.len());
            if request.direction == Direction::Write {
                state.written.push(data.to_vec());
            }
            state.responses.pop_front().unwrap_or(TxnStatus::Complete)
        });
        if status == TxnStatus::Complete && request.direction == Direction::Read {
            data.fill(Self::READ_FILL);
        }
        status
    }
}
