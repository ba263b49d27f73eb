// Cost attribution: price resolution and the calculation handlers.

pub mod handler;
pub mod resolver;

pub use handler::{
    CostCalculateHandler, CostCalculatePayload, CostRecomputeHandler, CostRecomputePayload,
};
pub use resolver::{canonical_model, PriceResolver};
