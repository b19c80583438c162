//! In-app notification fan-out for request activity.

use std::collections::BTreeSet;
use tracing::warn;

use crate::db::notifications::NewNotification;
use crate::db::{self, Pool};
use crate::model::{Request, User};

/// Who should hear about something that happened to a request.
#[derive(Debug, Default)]
pub struct Audience {
    ids: BTreeSet<i64>,
}

impl Audience {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, user_id: Option<i64>) -> &mut Self {
        if let Some(id) = user_id {
            self.ids.insert(id);
        }
        self
    }

    pub fn add_users(&mut self, users: &[User]) -> &mut Self {
        self.ids.extend(users.iter().map(|u| u.id));
        self
    }

    /// The actor never notifies themselves.
    pub fn without(&mut self, user_id: i64) -> &mut Self {
        self.ids.remove(&user_id);
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.ids.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Users of a company; empty if the lookup fails.
pub async fn company_users(pool: &Pool, company_id: i64) -> Vec<User> {
    db::users::list_by_company(pool, company_id)
        .await
        .unwrap_or_else(|err| {
            warn!(?err, company_id, "failed to load company users for notifications");
            Vec::new()
        })
}

/// All admins; empty if the lookup fails.
pub async fn admins(pool: &Pool) -> Vec<User> {
    db::users::list_admins(pool).await.unwrap_or_else(|err| {
        warn!(?err, "failed to load admins for notifications");
        Vec::new()
    })
}

/// Company users plus the assignee.
pub async fn request_watchers(pool: &Pool, request: &Request) -> (Audience, Vec<User>) {
    let company_users = company_users(pool, request.company_id).await;
    let mut audience = Audience::new();
    audience.add_users(&company_users).add(request.assigned_to);
    (audience, company_users)
}

/// Writes one notification per recipient. Failures are logged.
pub async fn send(pool: &Pool, audience: &Audience, kind: &str, title: &str, body: &str, request_id: Option<i64>) {
    for user_id in audience.ids() {
        let res = db::notifications::insert(
            pool,
            &NewNotification {
                user_id,
                kind,
                title,
                body,
                request_id,
            },
        )
        .await;
        if let Err(err) = res {
            warn!(?err, user_id, kind, "failed to store notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_dedupes_and_excludes_actor() {
        let mut a = Audience::new();
        a.add(Some(3)).add(Some(1)).add(None).add(Some(3)).without(1);
        assert_eq!(a.ids().collect::<Vec<_>>(), vec![3]);
        a.without(3);
        assert!(a.is_empty());
    }

    #[tokio::test]
    async fn lookup_failures_leave_an_empty_audience() {
        let pool = db::memory_pool().await.unwrap();
        pool.close().await;
        assert!(admins(&pool).await.is_empty());
        assert!(company_users(&pool, 1).await.is_empty());
    }
}
