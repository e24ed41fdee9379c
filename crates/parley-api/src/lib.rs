pub mod channels;
pub mod error;
pub mod messages;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use parley_gateway::presence::PresenceTracker;
use parley_gateway::router::DeliveryRouter;
use parley_store::Database;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Database,
    pub router: DeliveryRouter,
    pub presence: PresenceTracker,
    pub jwt_secret: String,
    /// How long an "actively viewing" record lives between heartbeats.
    pub presence_ttl: Duration,
}
