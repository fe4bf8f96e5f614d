use thiserror::Error;

use crate::line::LineId;
use crate::order::OrderKey;

/// Errors raised by the line store and the line authorities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BoardError {
    /// No integer key lies strictly between the two neighbours.
    #[error("insufficient space between order keys {lower} and {upper}")]
    InsufficientSpace { lower: OrderKey, upper: OrderKey },

    /// Applying the position would give two live lines the same key.
    #[error("order key {order} is already held by line {existing}")]
    OrderCollision { order: OrderKey, existing: LineId },

    /// A wire `number` outside the key range that is not the delete sentinel.
    #[error("invalid order value {0}")]
    InvalidOrder(i64),

    #[error("line {0} does not exist")]
    LineNotFound(LineId),

    /// The remote authority could not be reached or refused the request.
    #[error("authority error: {0}")]
    Authority(String),
}
