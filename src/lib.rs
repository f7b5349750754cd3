// modelmux — OpenAI-compatible fan-out gateway.
//
// Layering:
//   atoms/   pure data, constants, errors, the translator trait
//   engine/  the dispatch engine (budgets, rotation, breakers, retry loop)
//   server   the axum HTTP surface

pub mod atoms;
pub mod engine;
pub mod server;
