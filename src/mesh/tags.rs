//! Revision-tag discovery.
//!
//! Each mesh revision install (and each revision tag pointed at it) owns a
//! mutating webhook configuration carrying the revision and tag labels.
//! Namespaces select a tag by labeling themselves with the tag name, so the
//! webhook set plus the namespace labels yield the tag → revision →
//! namespaces mapping.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::labels::{REVISION_LABEL, TAG_LABEL};
use crate::Error;

/// A revision tag and the namespaces pointed at it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionTag {
    /// Tag name ("stable", "canary"); empty for a raw-revision webhook
    pub tag: String,
    /// Concrete control-plane revision the tag resolves to
    pub revision: String,
    /// Namespaces whose revision label equals the tag name
    pub namespaces: Vec<String>,
}

/// Cluster queries needed to assemble the tag mapping
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshApi: Send + Sync {
    /// All webhook configurations carrying the mesh revision label
    async fn list_revision_webhooks(&self) -> Result<Vec<MutatingWebhookConfiguration>, Error>;

    /// Names of namespaces whose revision label equals `tag`
    async fn namespaces_with_revision_label(&self, tag: &str) -> Result<Vec<String>, Error>;
}

/// Real [`MeshApi`] implementation backed by the cluster API
pub struct KubeMeshApi {
    client: Client,
}

impl KubeMeshApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn shared(client: Client) -> Arc<dyn MeshApi> {
        Arc::new(Self::new(client))
    }
}

#[async_trait]
impl MeshApi for KubeMeshApi {
    async fn list_revision_webhooks(&self) -> Result<Vec<MutatingWebhookConfiguration>, Error> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let webhooks = api
            .list(&ListParams::default().labels(REVISION_LABEL))
            .await?;
        Ok(webhooks.items)
    }

    async fn namespaces_with_revision_label(&self, tag: &str) -> Result<Vec<String>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let selector = format!("{REVISION_LABEL}={tag}");
        let namespaces = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(namespaces.items.iter().map(|ns| ns.name_any()).collect())
    }
}

/// Assemble the revision-tag set from the injection webhooks.
///
/// Raw-revision webhooks (revision label, no tag label) are kept only when no
/// tagged webhook resolves to the same revision. The result is sorted by
/// (revision, tag) so successive snapshots compare stably.
pub async fn collect_revision_tags(api: &dyn MeshApi) -> Result<Vec<RevisionTag>, Error> {
    let webhooks = api.list_revision_webhooks().await?;
    if webhooks.is_empty() {
        return Ok(Vec::new());
    }

    let mut raw: HashMap<(String, String), RevisionTag> = HashMap::new();
    for webhook in &webhooks {
        let labels = webhook.labels();
        let Some(revision) = labels.get(REVISION_LABEL).cloned() else {
            continue;
        };
        let tag = labels.get(TAG_LABEL).cloned().unwrap_or_default();
        let namespaces = api.namespaces_with_revision_label(&tag).await?;
        raw.insert(
            (revision.clone(), tag.clone()),
            RevisionTag {
                tag,
                revision,
                namespaces,
            },
        );
    }

    // Drop raw-revision entries shadowed by a tagged webhook for the same
    // revision.
    let tagged_revisions: Vec<String> = raw
        .keys()
        .filter(|(_, tag)| !tag.is_empty())
        .map(|(revision, _)| revision.clone())
        .collect();
    for revision in tagged_revisions {
        raw.remove(&(revision, String::new()));
    }

    let mut tags: Vec<RevisionTag> = raw.into_values().collect();
    tags.sort_by(|a, b| (&a.revision, &a.tag).cmp(&(&b.revision, &b.tag)));
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn webhook(name: &str, tag: Option<&str>, revision: &str) -> MutatingWebhookConfiguration {
        let mut labels = BTreeMap::new();
        labels.insert(REVISION_LABEL.to_string(), revision.to_string());
        if let Some(tag) = tag {
            labels.insert(TAG_LABEL.to_string(), tag.to_string());
        }
        labels.insert("app".to_string(), "sidecar-injector".to_string());
        MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_webhooks_yields_empty_set() {
        let mut api = MockMeshApi::new();
        api.expect_list_revision_webhooks()
            .returning(|| Ok(Vec::new()));
        api.expect_namespaces_with_revision_label().never();

        let tags = collect_revision_tags(&api).await.unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn test_tags_map_to_their_namespaces() {
        let mut api = MockMeshApi::new();
        api.expect_list_revision_webhooks().returning(|| {
            Ok(vec![
                webhook("stable-wh", Some("stable"), "v1-21-3-b16"),
                webhook("canary-wh", Some("canary"), "v1-22-0-b2"),
            ])
        });
        api.expect_namespaces_with_revision_label()
            .returning(|tag| match tag {
                "stable" => Ok(vec!["shop".to_string(), "billing".to_string()]),
                "canary" => Ok(vec!["edge".to_string()]),
                _ => Ok(Vec::new()),
            });

        let tags = collect_revision_tags(&api).await.unwrap();
        assert_eq!(
            tags,
            vec![
                RevisionTag {
                    tag: "stable".to_string(),
                    revision: "v1-21-3-b16".to_string(),
                    namespaces: vec!["shop".to_string(), "billing".to_string()],
                },
                RevisionTag {
                    tag: "canary".to_string(),
                    revision: "v1-22-0-b2".to_string(),
                    namespaces: vec!["edge".to_string()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_raw_revision_webhook_suppressed_by_tagged_twin() {
        let mut api = MockMeshApi::new();
        api.expect_list_revision_webhooks().returning(|| {
            Ok(vec![
                webhook("injector-v1-21-3-b16", None, "v1-21-3-b16"),
                webhook("stable-wh", Some("stable"), "v1-21-3-b16"),
            ])
        });
        api.expect_namespaces_with_revision_label()
            .returning(|tag| match tag {
                "stable" => Ok(vec!["shop".to_string()]),
                _ => Ok(Vec::new()),
            });

        let tags = collect_revision_tags(&api).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tag, "stable");
        assert_eq!(tags[0].revision, "v1-21-3-b16");
    }

    #[tokio::test]
    async fn test_raw_revision_webhook_kept_without_tagged_twin() {
        let mut api = MockMeshApi::new();
        api.expect_list_revision_webhooks().returning(|| {
            Ok(vec![
                webhook("injector-v1-20-0-b9", None, "v1-20-0-b9"),
                webhook("stable-wh", Some("stable"), "v1-21-3-b16"),
            ])
        });
        api.expect_namespaces_with_revision_label()
            .returning(|_| Ok(Vec::new()));

        let tags = collect_revision_tags(&api).await.unwrap();
        assert_eq!(tags.len(), 2);
        // sorted by (revision, tag)
        assert_eq!(tags[0].revision, "v1-20-0-b9");
        assert_eq!(tags[0].tag, "");
        assert_eq!(tags[1].tag, "stable");
    }

    #[tokio::test]
    async fn test_duplicate_tag_revision_pairs_collapse() {
        let mut api = MockMeshApi::new();
        api.expect_list_revision_webhooks().returning(|| {
            Ok(vec![
                webhook("stable-wh-a", Some("stable"), "v1-21-3-b16"),
                webhook("stable-wh-b", Some("stable"), "v1-21-3-b16"),
            ])
        });
        api.expect_namespaces_with_revision_label()
            .returning(|_| Ok(vec!["shop".to_string()]));

        let tags = collect_revision_tags(&api).await.unwrap();
        assert_eq!(tags.len(), 1);
    }
}
