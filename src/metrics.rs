use rayon::prelude::*;

use crate::error::{PmfError, Result};
use crate::history::History;
use crate::model::{score_sums, Model};

// ── Poisson log-loss (pure Rust, no pool of its own) ──────────────

/// Negated Poisson log-likelihood of `history` under the posterior means,
/// dropping the `ln y!` constant:
///
/// `Σ_u Σ_i Σ_k θ̄_uk β̄_ik − Σ_(u,i) y_ui · ln(Σ_k θ̄_uk β̄_ik)`
///
/// The first term runs over every (user, item) pair and is computed from
/// column sums. Lower is better. Runs on the current rayon pool.
pub fn pmf_logloss(model: &Model, history: &History) -> Result<f64> {
    if model.user_count() != history.user_count() || model.item_count() != history.item_count() {
        return Err(PmfError::ShapeMismatch {
            what: "model vs history (users * items)",
            expected: history.user_count() * history.item_count(),
            found: model.user_count() * model.item_count(),
        });
    }
    let k = model.k();
    let store = history.store();
    let (users, items) = (model.users(), model.items());

    let (observed, (user_sum, item_sum)) = rayon::join(
        || {
            (0..users.len())
                .into_par_iter()
                .map(|u| {
                    let group = store.group(u);
                    if group.is_empty() {
                        return 0.0;
                    }
                    let theta = users[u].scores();
                    group
                        .iter()
                        .filter(|rec| rec.count != 0)
                        .map(|rec| {
                            let beta = &items[rec.item as usize];
                            let rate: f64 = theta
                                .iter()
                                .zip(beta.shape1().iter().zip(beta.rate1()))
                                .map(|(t, (s, r))| t * s / r)
                                .sum();
                            rec.count as f64 * rate.ln()
                        })
                        .sum::<f64>()
                })
                .sum::<f64>()
        },
        || rayon::join(|| score_sums(users, k), || score_sums(items, k)),
    );

    let expected: f64 = user_sum.iter().zip(&item_sum).map(|(a, b)| a * b).sum();
    Ok(expected - observed)
}
