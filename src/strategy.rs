//! Orders a tier's model list before the failover orchestrator attempts it.
//! Sequential ordering is a no-op, random ordering shuffles, and adaptive
//! ordering weights a random draw by each model's current failure score.

use crate::config::RoutingStrategyKind;
use crate::health::HealthStore;
use rand::seq::SliceRandom;
use rand::Rng;

pub fn order_models(
    models: &[String],
    strategy: RoutingStrategyKind,
    health: &HealthStore,
) -> Vec<String> {
    match strategy {
        RoutingStrategyKind::Sequential => models.to_vec(),
        RoutingStrategyKind::Random => {
            let mut ordered = models.to_vec();
            ordered.shuffle(&mut rand::thread_rng());
            ordered
        }
        RoutingStrategyKind::Adaptive => adaptive_order(models, health),
    }
}

/// `weight = 1.0 / (1.0 + failure_score * 0.5)`, `score = random() * weight`,
/// sorted descending. The 0.5 coefficient is the "stronger variant" pinned by
/// the original: the same shape as the health-score formula's 0.2 but more
/// aggressive, since routing order should punish recent failures harder than
/// the health score displayed to operators does.
fn adaptive_order(models: &[String], health: &HealthStore) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut scored: Vec<(f64, String)> = models
        .iter()
        .map(|model| {
            let failure_score = health.failure_score(model);
            let weight = 1.0 / (1.0 + failure_score * 0.5);
            let draw: f64 = rng.gen();
            (draw * weight, model.clone())
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, model)| model).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_is_identity() {
        let health = HealthStore::new(0.05, None);
        let models = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ordered = order_models(&models, RoutingStrategyKind::Sequential, &health);
        assert_eq!(ordered, models);
    }

    #[test]
    fn random_preserves_set_membership() {
        let health = HealthStore::new(0.05, None);
        let models = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut ordered = order_models(&models, RoutingStrategyKind::Random, &health);
        ordered.sort();
        let mut expected = models.clone();
        expected.sort();
        assert_eq!(ordered, expected);
    }

    #[test]
    fn adaptive_favors_healthy_model_most_of_the_time() {
        let health = HealthStore::new(0.05, None);
        health.record_failure("flaky", 50.0, 0);
        let models = vec!["flaky".to_string(), "healthy".to_string()];

        let mut healthy_first = 0;
        for _ in 0..50 {
            let ordered = adaptive_order(&models, &health);
            if ordered[0] == "healthy" {
                healthy_first += 1;
            }
        }
        assert!(healthy_first > 30, "expected healthy model to usually win, got {healthy_first}/50");
    }
}
