//! SMTP listener: inbound mail for rooms and authenticated submission

mod auth;
mod server;
mod session;
mod tls;

pub use auth::{decode_login, decode_plain, hash_password, verify_password, Credentials};
pub use server::{SmtpServer, SmtpServiceType};
pub use session::{SessionConfig, SmtpSession};
pub use tls::create_tls_acceptor;
