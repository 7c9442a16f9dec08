mod handler;
mod model;

pub use handler::{get_nearby, update_presence};
pub use model::{NearbyQuery, NearbyUser, PresenceMap, PresenceRecord, UpdatePresenceRequest};
