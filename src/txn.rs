use alloc::{sync::Arc, vec, vec::Vec};
use core::fmt;

use bitfield_struct::bitfield;
use portable_atomic::{AtomicU32, Ordering};

use crate::{TxnError, TxnResult};

/// The maximum number of functional bus users, that can be registered at the same time.
pub const MAX_CLIENTS: usize = 4;
/// The maximum number of priorities a client can use.
pub const MAX_PRIORITIES: usize = 2;
/// The maximum number of buffers a single transaction can carry.
pub const MAX_XFER_BUFS: usize = 4;

/// Callback used for returning a finished transaction to its owner.
pub type TxnDoneCb = Arc<dyn Fn(Txn) + Send + Sync>;

/// The identifier of a functional bus user.
///
/// The id doubles as the function number on the bus. Only the low four bits are stored in the
/// transaction parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClientId(pub u8);
impl ClientId {
    /// The control function, which also carries the ELP register.
    pub const CTRL: Self = Self(0);
    pub const BT: Self = Self(1);
    pub const WLAN: Self = Self(2);

    pub const fn index(self) -> usize {
        self.0 as usize
    }
    /// Check if the id is within the supported range.
    pub const fn is_valid(self) -> bool {
        self.index() < MAX_CLIENTS
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    #[default]
    High,
    Low,
}
impl Priority {
    /// All priorities, from the highest to the lowest.
    pub const ALL: [Self; MAX_PRIORITIES] = [Self::High, Self::Low];

    pub const fn index(self) -> usize {
        self as usize
    }
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
    pub const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::High,
            _ => Self::Low,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    #[default]
    Read,
    Write,
}
impl Direction {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
    pub const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::Read,
            _ => Self::Write,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddrMode {
    /// The address advances with every byte transferred.
    #[default]
    Incrementing,
    /// All bytes go to the same address, like a FIFO register.
    Fixed,
}
impl AddrMode {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
    pub const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::Incrementing,
            _ => Self::Fixed,
        }
    }
}

/// The status a transaction finished with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CompletionStatus {
    #[default]
    Ok,
    Error,
    /// The transaction was in flight, while its client was being restarted.
    Recovery,
}
impl CompletionStatus {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
    pub const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Error,
            _ => Self::Recovery,
        }
    }
}

/// The packed parameters of a transaction.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TxnParams {
    #[bits(1)]
    pub priority: Priority,
    #[bits(4)]
    pub client: u8,
    #[bits(1)]
    pub direction: Direction,
    #[bits(1)]
    pub addr_mode: AddrMode,
    /// More data follows this transaction on the bus.
    pub more: bool,
    /// Power control transaction, which bypasses the regular queues.
    pub single_step: bool,
    /// This write is part of a burst, that is closed by the first write without this flag.
    pub aggregate: bool,
    #[bits(2)]
    pub status: CompletionStatus,
    #[bits(20)]
    __: u32,
}

/// Uniquely identifies a transaction for its entire lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxnId(pub u32);

static NEXT_TXN_ID: AtomicU32 = AtomicU32::new(0);

/// A single logical transfer request.
///
/// The transaction is moved through the core, so it is always owned by exactly one party: the
/// client, a queue, the bus backend or a done queue. Its owner gets it back either as part of a
/// [TxnOutcome] or through a [TxnDoneCb].
pub struct Txn {
    id: TxnId,
    params: TxnParams,
    hw_addr: u32,
    /// An empty buffer terminates the list.
    bufs: [Vec<u8>; MAX_XFER_BUFS],
    done_cb: Option<TxnDoneCb>,
}
impl Txn {
    /// Create a transaction without any buffers.
    pub fn new(client: ClientId, priority: Priority, direction: Direction, hw_addr: u32) -> Self {
        Self {
            id: TxnId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed)),
            params: TxnParams::new()
                .with_priority(priority)
                .with_client(client.0 & 0xf)
                .with_direction(direction),
            hw_addr,
            bufs: Default::default(),
            done_cb: None,
        }
    }
    /// Create a write transaction carrying `data`.
    pub fn write(client: ClientId, priority: Priority, hw_addr: u32, data: Vec<u8>) -> Self {
        let mut txn = Self::new(client, priority, Direction::Write, hw_addr);
        txn.bufs[0] = data;
        txn
    }
    /// Create a read transaction for `len` bytes.
    pub fn read(client: ClientId, priority: Priority, hw_addr: u32, len: usize) -> Self {
        let mut txn = Self::new(client, priority, Direction::Read, hw_addr);
        txn.bufs[0] = vec![0u8; len];
        txn
    }
    pub fn with_addr_mode(mut self, addr_mode: AddrMode) -> Self {
        self.params.set_addr_mode(addr_mode);
        self
    }
    pub fn with_more(mut self, more: bool) -> Self {
        self.params.set_more(more);
        self
    }
    pub fn with_single_step(mut self, single_step: bool) -> Self {
        self.params.set_single_step(single_step);
        self
    }
    pub fn with_aggregate(mut self, aggregate: bool) -> Self {
        self.params.set_aggregate(aggregate);
        self
    }
    /// Attach a callback, which is invoked once the transaction completes asynchronously.
    pub fn with_done_cb(mut self, done_cb: TxnDoneCb) -> Self {
        self.done_cb = Some(done_cb);
        self
    }
    /// Append a buffer to the list.
    ///
    /// Empty buffers are ignored, since they would terminate the list.
    pub fn add_buf(&mut self, buf: Vec<u8>) -> TxnResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let slot = self
            .bufs
            .iter_mut()
            .find(|slot| slot.is_empty())
            .ok_or(TxnError::TooManyBuffers)?;
        *slot = buf;
        Ok(())
    }

    pub fn id(&self) -> TxnId {
        self.id
    }
    pub fn params(&self) -> TxnParams {
        self.params
    }
    pub fn client(&self) -> ClientId {
        ClientId(self.params.client())
    }
    pub fn priority(&self) -> Priority {
        self.params.priority()
    }
    pub fn set_priority(&mut self, priority: Priority) {
        self.params.set_priority(priority);
    }
    pub fn direction(&self) -> Direction {
        self.params.direction()
    }
    pub fn is_write(&self) -> bool {
        self.direction() == Direction::Write
    }
    pub fn is_fixed_addr(&self) -> bool {
        self.params.addr_mode() == AddrMode::Fixed
    }
    pub fn more(&self) -> bool {
        self.params.more()
    }
    pub fn is_single_step(&self) -> bool {
        self.params.single_step()
    }
    pub fn is_aggregate(&self) -> bool {
        self.params.aggregate()
    }
    pub fn status(&self) -> CompletionStatus {
        self.params.status()
    }
    pub fn set_status(&mut self, status: CompletionStatus) {
        self.params.set_status(status);
    }
    pub fn hw_addr(&self) -> u32 {
        self.hw_addr
    }
    pub fn set_hw_addr(&mut self, hw_addr: u32) {
        self.hw_addr = hw_addr;
    }

    /// The number of buffers in use.
    pub fn buf_count(&self) -> usize {
        self.bufs
            .iter()
            .position(Vec::is_empty)
            .unwrap_or(MAX_XFER_BUFS)
    }
    /// Iterate over the buffers in use.
    pub fn bufs(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.bufs[..self.buf_count()].iter().map(Vec::as_slice)
    }
    pub fn buf(&self, index: usize) -> Option<&[u8]> {
        self.bufs().nth(index)
    }
    pub(crate) fn buf_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.bufs[index]
    }
    /// The number of bytes across all buffers.
    pub fn total_len(&self) -> usize {
        self.bufs().map(<[u8]>::len).sum()
    }
    /// Take the buffers out of the transaction.
    pub fn into_bufs(self) -> [Vec<u8>; MAX_XFER_BUFS] {
        self.bufs
    }
    pub(crate) fn take_done_cb(&mut self) -> Option<TxnDoneCb> {
        self.done_cb.take()
    }
}
impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("hw_addr", &self.hw_addr)
            .field("len", &self.total_len())
            .field("has_done_cb", &self.done_cb.is_some())
            .finish()
    }
}

/// The result of handing a transaction to the scheduler or the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxnStatus {
    Complete,
    Pending,
    Error,
}

/// The outcome of a transaction, returning ownership if it finished synchronously.
#[derive(Debug)]
pub enum TxnOutcome {
    /// The transaction finished within the call.
    Complete(Txn),
    /// The transaction will be returned later through a callback.
    Pending,
    /// The transaction failed synchronously. No callback will follow.
    Error(Txn),
}
impl TxnOutcome {
    pub fn status(&self) -> TxnStatus {
        match self {
            Self::Complete(_) => TxnStatus::Complete,
            Self::Pending => TxnStatus::Pending,
            Self::Error(_) => TxnStatus::Error,
        }
    }
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
    /// Take the transaction back, if it finished synchronously.
    pub fn into_txn(self) -> Option<Txn> {
        match self {
            Self::Complete(txn) | Self::Error(txn) => Some(txn),
            Self::Pending => None,
        }
    }
}
