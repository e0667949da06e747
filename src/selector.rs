use crate::config::ModelConfig;
use crate::error::DispatchError;
use crate::rotation::RotationStore;

/// Candidates for one request, already rotated so that index 0 is tried first.
#[derive(Debug, Clone)]
pub struct Selection {
    pub candidates: Vec<ModelConfig>,
    pub load_balance_key: String,
    pub start: usize,
}

pub fn load_balance_key(model_name: &str, provider_filters: &[String]) -> String {
    if provider_filters.is_empty() {
        return model_name.to_string();
    }
    let mut filters = provider_filters.to_vec();
    filters.sort();
    format!("{}-{}", model_name, filters.join("-"))
}

/// Collects every enabled model named `model_name` and rotates the list by the
/// cursor of its load-balance key. The cursor advances on every call, whatever the
/// outcome of the dispatch that follows.
///
/// Provider filters only partition the rotation state; they do not narrow the
/// candidate set.
pub fn select_candidates(
    models: &[ModelConfig],
    model_name: &str,
    provider_filters: &[String],
    rotation: &dyn RotationStore,
) -> Result<Selection, DispatchError> {
    let mut candidates: Vec<ModelConfig> = models
        .iter()
        .filter(|m| m.enabled && m.name == model_name)
        .cloned()
        .collect();
    if candidates.is_empty() {
        return Err(DispatchError::ModelNotFound(model_name.to_string()));
    }

    let load_balance_key = load_balance_key(model_name, provider_filters);
    let start = rotation.advance(&load_balance_key, candidates.len());
    candidates.rotate_left(start);

    Ok(Selection {
        candidates,
        load_balance_key,
        start,
    })
}
