//! Selects the `FileScopePredictor` implementation for `swarmctl start`
//! from the environment, following the same `SWARM_<ROLE>_URL` /
//! `SWARM_<ROLE>_MODEL` / `SWARM_<ROLE>_API_KEY` triple the teacher's
//! endpoint configuration uses for its other LLM roles (§4.2).

use coordination::devplan::{FileScopePredictor, LlmPredictor};

/// Build an `LlmPredictor` from `SWARM_PREDICTOR_URL` / `_MODEL` / `_API_KEY`.
/// Returns `None` (callers fall back to `NullPredictor`) when the endpoint
/// URL isn't configured — file-scope prediction is opt-in.
pub fn from_env() -> Option<Box<dyn FileScopePredictor>> {
    let url = std::env::var("SWARM_PREDICTOR_URL").ok()?;
    let model = std::env::var("SWARM_PREDICTOR_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let api_key = std::env::var("SWARM_PREDICTOR_API_KEY").unwrap_or_default();
    Some(Box::new(LlmPredictor::new(url, api_key, model)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn none_when_url_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("SWARM_PREDICTOR_URL");
        assert!(from_env().is_none());
    }

    #[test]
    fn some_when_url_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SWARM_PREDICTOR_URL", "http://localhost:1234/v1");
        let predictor = from_env();
        std::env::remove_var("SWARM_PREDICTOR_URL");
        assert!(predictor.is_some());
    }
}
