//! # `wlan-txn-core`
//! This is the transaction scheduling and bus power management core of a WLAN transport stack.
//! It sits between the functional drivers (WLAN, BT, ...) and the physical bus (SDIO or SPI) and
//! decides which transfer goes out next and when the device may sleep.
//! ## Overview
//! The core consists of three layers, which are wired together at runtime.
//!
//! ### Bus
//! The lowest layer is a [BusTransport], which performs one transaction at a time. A transaction
//! either finishes within the call, fails within the call or is reported later through a done
//! callback. The [BusDrv] is a reference transport, which splits transactions into block and byte
//! mode transfers for a [BusAdapter], aggregates bursts of small writes into one physical write
//! and continues asynchronous transfers from the adapter's completion context.
//!
//! ### Scheduling
//! The [TxnQueue] holds a FIFO per client and priority, plus a slot for a single step transaction
//! per client. Single step transactions are small power control writes, that bypass the regular
//! queues and are sent even if the client is stopped. Whenever something changes, a scheduling
//! pass is run, which submits transactions to the bus until one is pending and then hands all
//! finished transactions to their client's callback. The pass can be invoked from any context,
//! including the callbacks it invokes itself. A nested invocation only marks the pass for
//! another iteration and returns, so nothing is lost and no lock is ever held while calling out.
//! Exactly one transaction is in flight on the bus at any time.
//!
//! Finished transactions are parked in a [DoneQueue] until the pass gets around to invoking the
//! callbacks. This decouples the context, which observed the completion, from the one invoking
//! the callbacks.
//!
//! ### Power
//! The [TwIf] wraps the scheduler for the WLAN client and keeps track of how many transactions
//! are pending and how many users requested the device to stay awake. Once both drop to zero, it
//! stops the WLAN queues and writes the ELP register to put the device to sleep. A new
//! transaction wakes it up again, but the queues are only run once the device signaled, that it
//! is available.
//!
//! ### Restart
//! If a client is restarted while one of its transactions is on the bus, that transaction is
//! returned to the client with the status [CompletionStatus::Recovery] once it completes and
//! all other queued transactions are discarded. The [TwIf] guards this with a timer, so a stuck
//! bus can't block the recovery forever.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub(crate) mod fmt;

mod bus;
mod done_queue;
mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod sync;
mod twif;
mod txn;
mod txn_queue;

pub use bus::*;
pub use done_queue::DoneQueue;
pub use error::*;
pub use sync::{RestartSignal, WorkSignal};
pub use twif::*;
pub use txn::*;
pub use txn_queue::*;

type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
