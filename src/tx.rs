use crate::{Channel, Result};
use log::warn;

/// A transaction on a channel, created by
/// [`Channel::tx`](struct.Channel.html#method.tx) (which issues
/// `tx.select`).
///
/// Publishes and acks on the channel are batched until the guard is
/// resolved: [`commit`](#method.commit) makes them take effect atomically,
/// [`rollback`](#method.rollback) discards them. A guard dropped without
/// being resolved rolls back, so an early `?` return inside a transaction
/// block abandons its work.
///
/// # Example
///
/// ```rust,no_run
/// use coney::{Channel, Publish, Result};
///
/// fn publish_batch(channel: &Channel, bodies: &[&[u8]]) -> Result<()> {
///     let tx = channel.tx()?;
///     for body in bodies {
///         channel.basic_publish("", Publish::new(body, "work-queue"))?;
///     }
///     tx.commit()
/// }
/// ```
#[must_use = "a transaction rolls back when dropped without commit"]
pub struct Transaction<'a> {
    channel: &'a Channel,
    resolved: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(channel: &Channel) -> Result<Transaction> {
        channel.tx_select()?;
        Ok(Transaction {
            channel,
            resolved: false,
        })
    }

    /// Commit the work batched since the transaction started. A new
    /// transaction begins immediately on the channel.
    pub fn commit(mut self) -> Result<()> {
        self.resolved = true;
        self.channel.tx_commit()
    }

    /// Discard the work batched since the transaction started. Unacked
    /// deliveries are not automatically redelivered; use
    /// [`Channel::basic_recover`](struct.Channel.html#method.basic_recover)
    /// if that matters.
    pub fn rollback(mut self) -> Result<()> {
        self.resolved = true;
        self.channel.tx_rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(
                "rolling back unresolved transaction on channel {}",
                self.channel.channel_id()
            );
            let _ = self.channel.tx_rollback();
        }
    }
}
