mod handler;
pub(crate) mod model;

pub use handler::check_arrival;
pub use model::{ArrivalOutcome, ArrivalResponse, CheckArrivalRequest, is_within_radius};
