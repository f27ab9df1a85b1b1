//! RPC method names shared by the agent server and its clients.

pub const INSTANCE_REGISTER: &str = "instance.register";
pub const INSTANCE_UNREGISTER: &str = "instance.unregister";
pub const INSTANCE_HEARTBEAT: &str = "instance.heartbeat";
pub const INSTANCE_IDLE: &str = "instance.idle";
pub const INSTANCE_STATE_CHANGE: &str = "instance.state_change";

pub const AGENT_PING: &str = "agent.ping";
pub const AGENT_SHUTDOWN: &str = "agent.shutdown";
