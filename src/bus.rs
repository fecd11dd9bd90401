use tokio::sync::mpsc;

use crate::model::LogEvent;

/// Default bus capacity, per spec.md §4.4 ("capacity >= 64 events recommended").
pub const DEFAULT_CAPACITY: usize = 256;

/// A publish handle onto the shared event bus. Producers never error on
/// send failure — if the consumer has gone away, the send simply fails and
/// the caller is expected to keep draining its own source (see
/// `executor::run`) rather than deadlock the child on a blocked stdout pipe.
pub type Publisher = mpsc::Sender<LogEvent>;

/// The bus's single-consumer end.
pub type Subscriber = mpsc::Receiver<LogEvent>;

/// Creates a bounded channel carrying `LogEvent`s from many producers (two
/// per executor, plus watch-layer status messages) to the one chosen sink.
///
/// Closing the bus is the producers' collective responsibility: the
/// supervisor drops its clone once every executor has exited, and the
/// channel's last sender being dropped is what ends the consumer's stream.
pub fn channel(capacity: usize) -> (Publisher, Subscriber) {
    mpsc::channel(capacity)
}
