//! The template engine.
//!
//! Declarative YAML/JSON templates describe `entities x permission_sets x
//! targets`; this module parses, validates in two passes (structural then
//! semantic), flattens to concrete triples, diffs against observed state,
//! and applies the delta through C6. A whole template run is logged as one
//! `template_apply` operation -- its `results` vector carries
//! every flattened `AssignmentRecord`, since a template is not scoped to a
//! single principal or permission set the way assign/revoke are.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::accounts::filter::{evaluate, FilterExpr};
use crate::accounts::Account;
use crate::aws::AwsOperations;
use crate::error::CoreError;
use crate::executor::{AssignmentRecord, ErrorPolicy, ExecutionRequest, ExecutorConfig, MultiAccountExecutor};
use crate::log_info;
use crate::operations::{OperationKind, OperationRecord, OperationStore};
use crate::resolver::EntityResolver;
use crate::types::{AccountId, Direction, PermissionSetArn, PermissionSetName, PrincipalId, PrincipalName, PrincipalType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateTargets {
    #[serde(default)]
    pub account_ids: Option<Vec<String>>,
    #[serde(default)]
    pub account_tags: Option<String>,
    #[serde(default)]
    pub exclude_account_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateAssignment {
    pub entities: Vec<String>,
    pub permission_sets: Vec<String>,
    #[serde(default)]
    pub targets: TemplateTargets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub metadata: TemplateMetadata,
    pub assignments: Vec<TemplateAssignment>,
}

pub struct TemplateParser;

impl TemplateParser {
    pub fn parse_file(path: &Path) -> Result<Template, CoreError> {
        let contents = std::fs::read_to_string(path).map_err(|e| CoreError::Validation {
            field: "template_file".to_string(),
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::parse_yaml(&contents),
            Some("json") => Self::parse_json(&contents),
            other => Err(CoreError::Validation {
                field: "template_file".to_string(),
                message: format!("unrecognized template extension {other:?}, expected .yaml/.yml or .json"),
            }),
        }
    }

    pub fn parse_yaml(contents: &str) -> Result<Template, CoreError> {
        serde_yaml::from_str(contents).map_err(|e| CoreError::Validation {
            field: "template_file".to_string(),
            message: format!("invalid YAML template: {e}"),
        })
    }

    pub fn parse_json(contents: &str) -> Result<Template, CoreError> {
        serde_json::from_str(contents).map_err(|e| CoreError::Validation {
            field: "template_file".to_string(),
            message: format!("invalid JSON template: {e}"),
        })
    }

    /// Structural validation: required fields, entity prefixes,
    /// account selector syntax. Collects every violation instead of failing
    /// on the first.
    pub fn validate_structure(template: &Template) -> Vec<CoreError> {
        let mut errors = Vec::new();
        if template.metadata.name.trim().is_empty() {
            errors.push(CoreError::Validation {
                field: "metadata.name".to_string(),
                message: "template name is required".to_string(),
            });
        }
        if template.assignments.is_empty() {
            errors.push(CoreError::Validation {
                field: "assignments".to_string(),
                message: "template must declare at least one assignment".to_string(),
            });
        }
        for (idx, assignment) in template.assignments.iter().enumerate() {
            if assignment.entities.is_empty() {
                errors.push(CoreError::Validation {
                    field: format!("assignments[{idx}].entities"),
                    message: "at least one entity is required".to_string(),
                });
            }
            for entity in &assignment.entities {
                if parse_entity_ref(entity).is_none() {
                    errors.push(CoreError::Validation {
                        field: format!("assignments[{idx}].entities"),
                        message: format!("entity '{entity}' must be prefixed 'user:' or 'group:'"),
                    });
                }
            }
            if assignment.permission_sets.is_empty() {
                errors.push(CoreError::Validation {
                    field: format!("assignments[{idx}].permission_sets"),
                    message: "at least one permission set is required".to_string(),
                });
            }
            let targets = &assignment.targets;
            if targets.account_ids.is_none() && targets.account_tags.is_none() {
                errors.push(CoreError::Validation {
                    field: format!("assignments[{idx}].targets"),
                    message: "targets must set account_ids or account_tags".to_string(),
                });
            }
            if let Some(expr) = &targets.account_tags {
                if let Err(e) = FilterExpr::parse(expr) {
                    errors.push(e);
                }
            }
        }
        errors
    }
}

fn parse_entity_ref(entity: &str) -> Option<(PrincipalType, &str)> {
    if let Some(name) = entity.strip_prefix("user:") {
        Some((PrincipalType::User, name))
    } else if let Some(name) = entity.strip_prefix("group:") {
        Some((PrincipalType::Group, name))
    } else {
        None
    }
}

/// One fully resolved, flattened triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlattenedAssignment {
    pub principal_id: PrincipalId,
    pub principal_type: PrincipalType,
    pub principal_name: PrincipalName,
    pub permission_set_arn: PermissionSetArn,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub assignment: FlattenedAssignment,
    pub already_present: bool,
}

pub struct TemplateEngine<'a> {
    aws: &'a dyn AwsOperations,
    resolver: &'a EntityResolver<'a>,
    store: &'a dyn OperationStore,
    instance_arn: String,
}

impl<'a> TemplateEngine<'a> {
    pub fn new(aws: &'a dyn AwsOperations, resolver: &'a EntityResolver<'a>, store: &'a dyn OperationStore, instance_arn: impl Into<String>) -> Self {
        Self {
            aws,
            resolver,
            store,
            instance_arn: instance_arn.into(),
        }
    }

    /// Semantic validation plus flattening.
    /// Resolution failures across the whole template are batched rather
    /// than returned on first failure.
    pub async fn resolve_and_flatten(
        &self,
        template: &Template,
        accounts: &[Account],
    ) -> (Vec<FlattenedAssignment>, Vec<CoreError>) {
        let mut errors = Vec::new();
        let mut flattened = Vec::new();

        for assignment in &template.assignments {
            let mut entities = Vec::new();
            for entity in &assignment.entities {
                let Some((principal_type, name)) = parse_entity_ref(entity) else {
                    continue; // already reported by validate_structure
                };
                match self.resolver.resolve_principal(principal_type, name).await {
                    Ok(id) => entities.push((id, principal_type, PrincipalName(name.to_string()))),
                    Err(e) => errors.push(e),
                }
            }

            let mut permission_set_arns = Vec::new();
            for ps in &assignment.permission_sets {
                if let Some(arn) = ps.strip_prefix("arn:") {
                    permission_set_arns.push(PermissionSetArn(format!("arn:{arn}")));
                    continue;
                }
                match self.resolver.resolve_permission_set(ps).await {
                    Ok(arn) => permission_set_arns.push(PermissionSetArn(arn)),
                    Err(e) => errors.push(e),
                }
            }

            let target_accounts = match self.evaluate_targets(&assignment.targets, accounts) {
                Ok(ids) => ids,
                Err(e) => {
                    errors.push(e);
                    Vec::new()
                }
            };

            for (principal_id, principal_type, principal_name) in &entities {
                for permission_set_arn in &permission_set_arns {
                    for account_id in &target_accounts {
                        flattened.push(FlattenedAssignment {
                            principal_id: principal_id.clone(),
                            principal_type: *principal_type,
                            principal_name: principal_name.clone(),
                            permission_set_arn: permission_set_arn.clone(),
                            account_id: account_id.clone(),
                        });
                    }
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        flattened.retain(|f| seen.insert(f.clone()));

        (flattened, errors)
    }

    fn evaluate_targets(&self, targets: &TemplateTargets, accounts: &[Account]) -> Result<Vec<AccountId>, CoreError> {
        let mut matched: Vec<AccountId> = if let Some(ids) = &targets.account_ids {
            ids.iter().map(|id| AccountId(id.clone())).collect()
        } else if let Some(expr) = &targets.account_tags {
            let parsed = FilterExpr::parse(expr)?;
            evaluate(&parsed, accounts).into_iter().map(|a| a.id).collect()
        } else {
            Vec::new()
        };
        if let Some(excluded) = &targets.exclude_account_ids {
            let excluded: std::collections::HashSet<&String> = excluded.iter().collect();
            matched.retain(|id| !excluded.contains(&id.0));
        }
        Ok(matched)
    }

    /// Probes current state so `--dry-run` can render a diff without
    /// mutating anything.
    pub async fn diff(&self, flattened: Vec<FlattenedAssignment>) -> Vec<DiffEntry> {
        let mut entries = Vec::with_capacity(flattened.len());
        for assignment in flattened {
            let already_present = self
                .aws
                .list_account_assignments(&self.instance_arn, &assignment.account_id.0, &assignment.permission_set_arn.0)
                .await
                .map(|tuples| tuples.iter().any(|t| t.principal_id == assignment.principal_id.0))
                .unwrap_or(false);
            entries.push(DiffEntry { assignment, already_present });
        }
        entries
    }

    /// Submits only the additions through the multi-account executor,
    /// grouped by (principal, permission-set) since that is the executor's
    /// contract; all results are merged into a single `template_apply`
    /// operation record. With `dry_run` set, no AWS calls are made and no
    /// operation record is written -- the diff alone is the answer.
    pub async fn apply(
        &self,
        template_name: &str,
        diff: Vec<DiffEntry>,
        concurrency: u32,
        max_retries: u32,
        dry_run: bool,
    ) -> Result<Option<OperationRecord>, CoreError> {
        let additions: Vec<FlattenedAssignment> = diff.into_iter().filter(|d| !d.already_present).map(|d| d.assignment).collect();
        log_info!("template '{template_name}' apply: {} additions to submit", additions.len());
        if dry_run || additions.is_empty() {
            return Ok(None);
        }

        let mut groups: HashMap<(PrincipalId, PermissionSetArn), (PrincipalType, Vec<AccountId>)> = HashMap::new();
        for a in &additions {
            groups
                .entry((a.principal_id.clone(), a.permission_set_arn.clone()))
                .or_insert_with(|| (a.principal_type, Vec::new()))
                .1
                .push(a.account_id.clone());
        }

        let executor = MultiAccountExecutor::new(
            self.aws,
            ExecutorConfig {
                max_concurrent_accounts: concurrency,
                account_timeout: std::time::Duration::from_secs(60),
                max_retries,
                error_policy: ErrorPolicy::ContinueOnError,
            },
        );

        let mut all_results: Vec<AssignmentRecord> = Vec::new();
        let mut all_account_ids: Vec<AccountId> = Vec::new();
        for ((principal_id, permission_set_arn), (principal_type, account_ids)) in groups {
            let request = ExecutionRequest {
                principal_id,
                principal_type,
                permission_set_arn,
                instance_arn: self.instance_arn.clone(),
                accounts: account_ids,
                direction: Direction::Assign,
            };
            let mut results = executor
                .execute(request, std::sync::Arc::new(tokio::sync::Notify::new()), None)
                .await;
            all_account_ids.extend(results.iter().map(|r| r.account_id.clone()));
            all_results.append(&mut results);
        }

        let record = OperationRecord::new(
            OperationKind::TemplateApply,
            PrincipalId("n/a".to_string()),
            PrincipalType::User,
            PrincipalName("n/a".to_string()),
            PermissionSetArn("n/a".to_string()),
            PermissionSetName(template_name.to_string()),
            all_account_ids,
            Vec::new(),
            all_results,
            Default::default(),
        );
        self.store.append(record.clone()).await.map_err(|e| CoreError::System { message: e.to_string() })?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::mock::MockAws;
    use crate::cache::file::FileBackend;
    use crate::config::CacheTtlTable;
    use crate::operations::json_file::JsonFileOperationStore;
    use crate::types::AccountName;
    use tempfile::tempdir;

    fn sample_accounts() -> Vec<Account> {
        vec![
            Account {
                id: AccountId("111122223333".to_string()),
                name: AccountName("dev1".to_string()),
                email: "dev1@example.com".to_string(),
                status: crate::types::AccountStatus::Active,
                ou_id: "ou-1".to_string(),
                tags: [("Env".to_string(), "Dev".to_string()), ("Critical".to_string(), "true".to_string())].into(),
            },
            Account {
                id: AccountId("222233334444".to_string()),
                name: AccountName("dev2".to_string()),
                email: "dev2@example.com".to_string(),
                status: crate::types::AccountStatus::Active,
                ou_id: "ou-1".to_string(),
                tags: [("Env".to_string(), "Dev".to_string())].into(),
            },
        ]
    }

    #[test]
    fn yaml_template_parses() {
        let yaml = r#"
metadata:
  name: baseline
assignments:
  - entities: ["user:alice"]
    permission_sets: ["ReadOnly"]
    targets:
      account_tags: "tag:Env=Dev AND NOT tag:Critical=true"
"#;
        let template = TemplateParser::parse_yaml(yaml).unwrap();
        assert_eq!(template.metadata.name, "baseline");
        assert_eq!(template.assignments[0].entities, vec!["user:alice".to_string()]);
    }

    #[test]
    fn structural_validation_flags_bad_entity_prefix() {
        let template = Template {
            metadata: TemplateMetadata { name: "t".to_string(), description: None, version: None },
            assignments: vec![TemplateAssignment {
                entities: vec!["alice".to_string()],
                permission_sets: vec!["ReadOnly".to_string()],
                targets: TemplateTargets { account_ids: Some(vec!["111".to_string()]), ..Default::default() },
            }],
        };
        let errors = TemplateParser::validate_structure(&template);
        assert!(!errors.is_empty());
    }

    #[tokio::test]
    async fn tag_selector_excludes_critical_account() {
        let aws = MockAws::new();
        aws.add_user(crate::aws::RawUser { id: "u-1".to_string(), username: "alice".to_string() });
        aws.add_permission_set("arn:ps:ReadOnly", crate::aws::PermissionSetConfig { name: "ReadOnly".to_string(), ..Default::default() });
        let dir = tempdir().unwrap();
        let cache = FileBackend::open(dir.path(), None).unwrap();
        let resolver = EntityResolver::new(&aws, &cache, "dev", aws.instance_arn.clone(), aws.identity_store_id.clone(), CacheTtlTable::default());
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let engine = TemplateEngine::new(&aws, &resolver, &store, aws.instance_arn.clone());

        let template = Template {
            metadata: TemplateMetadata { name: "baseline".to_string(), description: None, version: None },
            assignments: vec![TemplateAssignment {
                entities: vec!["user:alice".to_string()],
                permission_sets: vec!["ReadOnly".to_string()],
                targets: TemplateTargets {
                    account_ids: None,
                    account_tags: Some("tag:Env=Dev AND NOT tag:Critical=true".to_string()),
                    exclude_account_ids: None,
                },
            }],
        };

        let (flattened, errors) = engine.resolve_and_flatten(&template, &sample_accounts()).await;
        assert!(errors.is_empty());
        assert_eq!(flattened.len(), 1);
        assert_eq!(flattened[0].account_id.0, "222233334444");
    }

    #[tokio::test]
    async fn dry_run_apply_produces_no_operation_record() {
        let aws = MockAws::new();
        let dir = tempdir().unwrap();
        let cache = FileBackend::open(dir.path(), None).unwrap();
        let resolver = EntityResolver::new(&aws, &cache, "dev", aws.instance_arn.clone(), aws.identity_store_id.clone(), CacheTtlTable::default());
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let engine = TemplateEngine::new(&aws, &resolver, &store, aws.instance_arn.clone());

        let diff = vec![DiffEntry {
            assignment: FlattenedAssignment {
                principal_id: PrincipalId("p-1".to_string()),
                principal_type: PrincipalType::User,
                principal_name: PrincipalName("alice".to_string()),
                permission_set_arn: PermissionSetArn("arn:ps:ReadOnly".to_string()),
                account_id: AccountId("111122223333".to_string()),
            },
            already_present: false,
        }];

        let result = engine.apply("baseline", diff, 10, 2, true).await.unwrap();
        assert!(result.is_none());
        assert!(!aws.has_assignment("111122223333", "arn:ps:ReadOnly", "p-1"));
    }

    #[tokio::test]
    async fn apply_submits_additions_and_records_operation() {
        let aws = MockAws::new();
        let dir = tempdir().unwrap();
        let cache = FileBackend::open(dir.path(), None).unwrap();
        let resolver = EntityResolver::new(&aws, &cache, "dev", aws.instance_arn.clone(), aws.identity_store_id.clone(), CacheTtlTable::default());
        let store = JsonFileOperationStore::open(dir.path().join("ops.jsonl")).unwrap();
        let engine = TemplateEngine::new(&aws, &resolver, &store, aws.instance_arn.clone());

        let diff = vec![DiffEntry {
            assignment: FlattenedAssignment {
                principal_id: PrincipalId("p-1".to_string()),
                principal_type: PrincipalType::User,
                principal_name: PrincipalName("alice".to_string()),
                permission_set_arn: PermissionSetArn("arn:ps:ReadOnly".to_string()),
                account_id: AccountId("111122223333".to_string()),
            },
            already_present: false,
        }];

        let record = engine.apply("baseline", diff, 10, 2, false).await.unwrap().unwrap();
        assert_eq!(record.kind, OperationKind::TemplateApply);
        assert_eq!(record.results.len(), 1);
        assert!(aws.has_assignment("111122223333", "arn:ps:ReadOnly", "p-1"));
    }
}
