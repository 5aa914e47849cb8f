//! The account, its settings and notifications.

use crate::cache::{
    EntityType, KeyPath, KeyPattern, MutationEffect, MutationOutcome, Operation, PageRequest,
    QueryRegistry, RegistryError, Staleness, Updater,
};
use crate::infra::api::ApiClient;

use super::catalog::MutationCatalog;
use super::collection::{Write, detail_fetcher, mutation, page_fetcher};

const DOMAIN: &str = "account";

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    let root = KeyPattern::new().exact(EntityType::Account.namespace());
    registry.register_fn(DOMAIN, root.clone(), detail_fetcher(api, "account"), Staleness::Default)?;
    registry.register_fn(
        DOMAIN,
        root.clone().exact("settings"),
        detail_fetcher(api, "account/settings"),
        Staleness::Default,
    )?;
    registry.register_fn(
        DOMAIN,
        root.exact("notifications").any("paginated"),
        page_fetcher(api, "account/notifications"),
        Staleness::Default,
    )
}

pub fn account_key() -> KeyPath {
    EntityType::Account.root()
}

pub fn settings_key() -> KeyPath {
    account_key().child("settings")
}

pub fn notifications_key(request: &PageRequest) -> KeyPath {
    account_key()
        .child("notifications")
        .child_with("paginated", request.to_params())
}

pub fn mutations(api: &ApiClient, catalog: &mut MutationCatalog) {
    catalog.extend([
        mutation(api, "account.update", EntityType::Account, Operation::Update, Write::Put("account"))
            .effect(|outcome| store_at(account_key(), outcome)),
        mutation(
            api,
            "account.settings.update",
            EntityType::Account,
            Operation::Update,
            Write::Put("account/settings"),
        )
        .effect(|outcome| store_at(settings_key(), outcome)),
    ]);
}

fn store_at(key: KeyPath, outcome: &MutationOutcome<'_>) -> Vec<MutationEffect> {
    vec![MutationEffect::patch(key, Updater::replace(outcome.response.clone()))]
}
