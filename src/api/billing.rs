use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use super::{AppState, CACHE_MRR};
use crate::auth::Principal;
use crate::billing::{self, map_subscription_status, Subscription};
use crate::db;
use crate::db::companies::CompanyChanges;
use crate::error::{ApiError, ApiResult};
use crate::model::{Company, CompanyStatus};

fn summary(sub: &Subscription) -> Value {
    json!({
        "id": sub.id,
        "customer_id": sub.customer_id,
        "status": sub.status,
        "mapped_status": map_subscription_status(&sub.status),
        "total": sub.total,
        "currency": sub.currency,
        "billing_period": sub.billing_period,
        "next_payment_date_gmt": sub.next_payment_date_gmt,
        "line_items": sub.line_items,
    })
}

/// Picks the subscription to link for a customer: an active one if any.
fn pick_subscription(mut subs: Vec<Subscription>) -> Option<Subscription> {
    let active = subs
        .iter()
        .position(|s| map_subscription_status(&s.status) == Some(CompanyStatus::Active));
    match active {
        Some(i) => Some(subs.swap_remove(i)),
        None => subs.into_iter().next(),
    }
}

pub async fn show(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    principal.ensure_company_access(id)?;
    let company = super::companies::load(&state, id).await?;
    let Some(sub_id) = company.woo_subscription_id else {
        return Ok(Json(json!({ "linked": false, "subscription": null })));
    };
    let sub = state.billing.get_subscription(sub_id).await?;
    Ok(Json(json!({ "linked": true, "subscription": summary(&sub) })))
}

pub async fn sync(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> ApiResult<Json<Company>> {
    principal.require_admin()?;
    let company = super::companies::load(&state, id).await?;

    let sub = match (company.woo_subscription_id, company.woo_customer_id) {
        (Some(sub_id), _) => state.billing.get_subscription(sub_id).await?,
        (None, Some(customer_id)) => {
            let subs = state.billing.list_customer_subscriptions(customer_id).await?;
            let sub = pick_subscription(subs)
                .ok_or_else(|| ApiError::conflict("customer has no subscriptions"))?;
            // Link first so the apply step updates this company.
            db::companies::update(
                &state.pool,
                id,
                &CompanyChanges {
                    woo_subscription_id: Some(sub.id),
                    ..Default::default()
                },
            )
            .await?
            .ok_or(ApiError::NotFound("company"))?;
            sub
        }
        (None, None) => return Err(ApiError::conflict("company is not linked to billing")),
    };

    let applied = billing::apply_subscription(&state.pool, &state.cfg, &sub, None).await?;
    info!(company_id = id, subscription_id = sub.id, "billing synced");
    db::audit::record(
        &state.pool,
        Some(principal.user_id),
        "company.billing_synced",
        "company",
        Some(id),
        json!({
            "subscription_id": sub.id,
            "subscription_status": sub.status,
            "status": applied.company.status,
            "plan_tier": applied.company.plan_tier,
        }),
    )
    .await;
    state.invalidate_companies();
    Ok(Json(applied.company))
}

pub async fn mrr(State(state): State<AppState>, principal: Principal) -> ApiResult<Json<Value>> {
    principal.require_admin()?;
    if let Some(hit) = state.cache.get(CACHE_MRR) {
        return Ok(Json(hit));
    }
    let summary = db::companies::mrr(&state.pool).await?;
    let body = json!(summary);
    state.cache.set(CACHE_MRR, body.clone());
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::model::BillingAddress;

    fn sub(id: i64, status: &str) -> Subscription {
        Subscription {
            id,
            customer_id: 9,
            status: status.into(),
            billing: BillingAddress::default(),
            line_items: Vec::new(),
            total: "0".into(),
            currency: "USD".into(),
            billing_period: "month".into(),
            next_payment_date_gmt: None,
        }
    }

    #[test]
    fn prefers_active_subscription() {
        let picked = pick_subscription(vec![sub(1, "cancelled"), sub(2, "active"), sub(3, "on-hold")]);
        assert_eq!(picked.map(|s| s.id), Some(2));
        let picked = pick_subscription(vec![sub(4, "expired"), sub(5, "on-hold")]);
        assert_eq!(picked.map(|s| s.id), Some(4));
        assert!(pick_subscription(Vec::new()).is_none());
    }
}
