pub mod deliveries;
pub mod health;
