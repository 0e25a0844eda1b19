pub mod claude2antigravity;
pub mod claude2gemini;
pub mod geminicli2gemini;
pub mod openai2gemini;
pub mod passthrough;

use crate::registry::Registry;

pub fn register_all(registry: &mut Registry) {
    claude2gemini::register(registry);
    claude2antigravity::register(registry);
    openai2gemini::register(registry);
    geminicli2gemini::register(registry);
    passthrough::register(registry);
}
