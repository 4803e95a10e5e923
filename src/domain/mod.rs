// Domain layer: core models and ports (interfaces). No storage or IO concerns here.

pub mod model;
pub mod ports;
