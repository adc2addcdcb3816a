pub mod nats;
pub mod rabbitmq;
