use crate::db::models::AlertRow;
use crate::types::AlertType;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvaluation {
    pub triggered: bool,
    pub reason: String,
}

impl AlertEvaluation {
    fn no(reason: impl Into<String>) -> Self {
        Self {
            triggered: false,
            reason: reason.into(),
        }
    }

    fn yes(reason: impl Into<String>) -> Self {
        Self {
            triggered: true,
            reason: reason.into(),
        }
    }
}

/// Pure trigger predicate for one alert against the latest scrape outcome.
///
/// BACK_IN_STOCK looks only at the stock transition. Every price-based type
/// requires the product to be in stock. PERCENT_DROP applies the absolute
/// `min_change_threshold` gate before the percentage test; ANY_CHANGE applies
/// it to the absolute move.
pub fn evaluate(
    alert: &AlertRow,
    current_price: f64,
    previous_price: Option<f64>,
    in_stock: bool,
    was_in_stock: Option<bool>,
) -> AlertEvaluation {
    if !alert.active {
        return AlertEvaluation::no("alert is not active");
    }

    if alert.alert_type == AlertType::BackInStock {
        return if in_stock && was_in_stock == Some(false) {
            AlertEvaluation::yes("product is back in stock")
        } else {
            AlertEvaluation::no("stock status unchanged or still out of stock")
        };
    }

    if !in_stock {
        return AlertEvaluation::no("product is out of stock");
    }

    match alert.alert_type {
        AlertType::TargetPrice => {
            let Some(target) = alert.target_value else {
                return AlertEvaluation::no("no target set");
            };
            if current_price <= target {
                AlertEvaluation::yes(format!(
                    "price ${current_price:.2} is at or below target ${target:.2}"
                ))
            } else {
                AlertEvaluation::no(format!(
                    "price ${current_price:.2} is above target ${target:.2}"
                ))
            }
        }
        AlertType::PercentDrop => {
            let Some(previous) = previous_price.filter(|p| *p > 0.0) else {
                return AlertEvaluation::no("no previous price to compare");
            };
            let drop = previous - current_price;
            if drop < alert.min_change_threshold {
                return AlertEvaluation::no(format!(
                    "price drop ${drop:.2} below threshold ${:.2}",
                    alert.min_change_threshold
                ));
            }
            let drop_percent = drop / previous * 100.0;
            let target_percent = alert.target_value.unwrap_or(0.0);
            if drop_percent >= target_percent {
                AlertEvaluation::yes(format!(
                    "price dropped {drop_percent:.1}% (target: {target_percent:.1}%)"
                ))
            } else {
                AlertEvaluation::no(format!(
                    "drop of {drop_percent:.1}% is below target {target_percent:.1}%"
                ))
            }
        }
        AlertType::AnyChange => {
            let Some(previous) = previous_price else {
                return AlertEvaluation::no("no previous price to compare");
            };
            let diff = (current_price - previous).abs();
            if diff < alert.min_change_threshold {
                AlertEvaluation::no(format!(
                    "price change ${diff:.2} below threshold ${:.2}",
                    alert.min_change_threshold
                ))
            } else {
                AlertEvaluation::yes(format!(
                    "price changed from ${previous:.2} to ${current_price:.2}"
                ))
            }
        }
        AlertType::BackInStock => unreachable!("handled above"),
    }
}
