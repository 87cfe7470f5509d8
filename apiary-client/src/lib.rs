//! apiary-client - talk to an apiary server
//!
//! [`ApiClient`] sends catalog commands over HTTP and unwraps the response
//! envelope; [`EventBridge`] delivers pushed session events to listeners.
//!
//! ```no_run
//! use apiary_client::ApiClient;
//! use serde_json::json;
//!
//! async fn example() -> Result<(), apiary_client::ClientError> {
//!     let client = ApiClient::new("http://127.0.0.1:3000")?;
//!     client.login("admin", "admin").await?;
//!
//!     client
//!         .events()
//!         .add_listener("query:complete", |event| println!("{event}"))
//!         .await?;
//!
//!     client
//!         .send("conn/create", json!({"config": {"connectionType": "sqlite", "database": "hive.db"}}))
//!         .await?;
//!     client.send("conn/query", json!({"query": "SELECT 1"})).await?;
//!     Ok(())
//! }
//! ```

mod api;
mod bridge;
mod error;
mod token;

pub use api::ApiClient;
pub use bridge::{BridgeState, EventBridge, Listener, ListenerId};
pub use error::ClientError;
pub use token::TokenStore;
