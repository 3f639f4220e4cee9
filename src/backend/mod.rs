pub mod gradio;
pub mod register;
pub mod template;

pub use template::InferenceBackend;

#[cfg(test)]
pub mod mock;
