pub mod gateway;
pub mod intents;
pub mod interaction;
pub mod snowflake;
pub mod voice;

pub use intents::GatewayIntents;
pub use snowflake::Snowflake;
