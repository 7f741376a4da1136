mod broker;

pub use broker::NatsBroker;
