pub mod actuator;
pub mod decision_engine;
pub mod export;
pub mod governor;
pub mod policy;
pub mod ring_buffer;
