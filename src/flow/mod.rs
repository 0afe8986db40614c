pub mod congestion;
pub mod flow_control;
pub mod rtt;
