pub mod mock;
pub mod openai_compatible;
