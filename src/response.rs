//! Module containing the [Response] type, which layers an outbound
//! notification log on top of a [Decision].
//!
//! Notifications are the messages an accepted command wants delivered to
//! the outside world through the [Outbox][crate::outbox]. They follow the
//! fate of the transaction they belong to: they accumulate while the
//! composition keeps accepting, and are erased the moment a later step
//! rejects. See [Response::and_then] for the exact rules.

use crate::decision::Decision;

/// A [Decision] paired with the notifications recorded while reaching it.
///
/// `R` is the rejection reason type, `E` the Domain Event type, `N` the
/// notification type and `A` the value returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<R, E, N, A = ()> {
    /// The underlying decision.
    pub decision: Decision<R, E, A>,

    /// The notifications to deliver if the surrounding transaction
    /// commits, in recording order.
    pub notifications: Vec<N>,
}

impl<R, E, N, A> From<Decision<R, E, A>> for Response<R, E, N, A> {
    fn from(decision: Decision<R, E, A>) -> Self {
        Self {
            decision,
            notifications: Vec::new(),
        }
    }
}

impl<R, E, N, A> Response<R, E, N, A> {
    /// Creates a new [Response] from a decision and its notifications.
    pub fn new(decision: Decision<R, E, A>, notifications: Vec<N>) -> Self {
        Self {
            decision,
            notifications,
        }
    }

    /// Lifts a plain value into an indecisive [Response] with no
    /// notifications.
    pub fn pure(value: A) -> Self {
        Self::from(Decision::pure(value))
    }

    /// Records a notification, regardless of the current decision.
    #[must_use]
    pub fn publish(mut self, notification: N) -> Self {
        self.notifications.push(notification);
        self
    }

    /// Records all the provided notifications, regardless of the current
    /// decision.
    #[must_use]
    pub fn publish_all(mut self, notifications: impl IntoIterator<Item = N>) -> Self {
        self.notifications.extend(notifications);
        self
    }

    /// Records a notification only when the current decision is a
    /// rejection.
    ///
    /// Useful to report a failed intent downstream while the regular
    /// notifications of the transaction are dropped.
    #[must_use]
    pub fn publish_on_rejection(mut self, notification: N) -> Self {
        if self.decision.is_rejected() {
            self.notifications.push(notification);
        }

        self
    }

    /// Clears the recorded notifications, keeping the decision.
    #[must_use]
    pub fn reset(mut self) -> Self {
        self.notifications.clear();
        self
    }

    /// Applies the provided function to the caller value, leaving the
    /// decision shape and the notifications untouched.
    #[must_use]
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Response<R, E, N, B> {
        Response {
            decision: self.decision.map(f),
            notifications: self.notifications,
        }
    }

    /// Sequences a second [Response] after this one.
    ///
    /// Decisions compose by [Decision::and_then]. Notifications follow
    /// the transaction:
    ///
    /// * if this response is already rejected, it is returned unchanged
    ///   and `f` is not run;
    /// * if the *second* response rejects, only the second response's
    ///   notifications survive -- the ones recorded before the rejection
    ///   are erased together with the events of this transaction;
    /// * otherwise notifications accumulate in recording order.
    #[must_use]
    pub fn and_then<B>(self, f: impl FnOnce(A) -> Response<R, E, N, B>) -> Response<R, E, N, B> {
        let mut notifications = self.notifications;

        let decision = match self.decision {
            Decision::Rejected(reasons) => {
                return Response {
                    decision: Decision::Rejected(reasons),
                    notifications,
                }
            },
            Decision::Indecisive(value) => Decision::pure(value),
            Decision::Accepted(events, value) => Decision::accept_returning(value, events),
        };

        let next = decision.and_then(|value| {
            let next = f(value);

            if next.decision.is_rejected() {
                notifications.clear();
            }

            notifications.extend(next.notifications);
            next.decision
        });

        Response {
            decision: next,
            notifications,
        }
    }
}
