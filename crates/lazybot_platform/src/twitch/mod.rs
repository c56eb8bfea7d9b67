#![forbid(unsafe_code)]

pub mod eventsub;
pub mod helix;
pub mod irc;
pub mod oauth;

pub use helix::{HelixClient, HelixStreamStatus};
pub use irc::{IrcConfig, IrcTransport, is_auth_failure};
pub use oauth::{TokenEndpoint, TokenEndpointError, TokenRefreshResponse, TwitchOAuth};
