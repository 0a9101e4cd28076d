pub mod server;

use crate::api::ApiConfig;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        config: Box<ApiConfig>,
    },
}
