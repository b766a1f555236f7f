// Pipeline stages, leaf first.
pub mod frame;
pub mod morphology;
pub mod background_model;
pub mod optical_flow;
pub mod motion_scorer;
pub mod detection_gate;
pub mod session_clock;
pub mod lap_timer;
