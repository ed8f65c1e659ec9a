pub use kocao_common::args::ControlPlaneArgs as Args;
