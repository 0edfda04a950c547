/// Errors returned synchronously by the registration and construction APIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxnError {
    /// The client id is outside of `0..MAX_CLIENTS`.
    InvalidClient,
    /// The priority count is zero or exceeds [MAX_PRIORITIES](crate::MAX_PRIORITIES), or the
    /// transaction uses a priority its client didn't open.
    InvalidPriority,
    /// The client is already registered.
    AlreadyOpen,
    /// The client isn't registered.
    NotOpen,
    /// All [MAX_XFER_BUFS](crate::MAX_XFER_BUFS) buffer slots of the transaction are in use.
    TooManyBuffers,
}

pub type TxnResult<T> = Result<T, TxnError>;

/// The kind of failure reported through the bus error callback of [TwIf](crate::TwIf).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FailureKind {
    /// A transaction failed on the bus, either synchronously or asynchronously.
    BusFailure,
}

/// How a pending restart of [TwIf](crate::TwIf) ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RestartOutcome {
    /// The straggling transaction completed and the queues were cleared.
    Completed,
    /// The guard timer expired first and the queues were cleared forcibly.
    TimedOut,
}
