pub mod consistency;
pub mod dialogue;
pub mod identity;
pub mod llm;
pub mod outline;
pub mod payload;
pub mod resilience;
pub mod scene;
pub mod visual;
pub mod workflow;
