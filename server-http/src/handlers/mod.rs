pub mod bus;
pub mod health;

pub use bus::send_envelope;
pub use health::health_check;
