//! Association definitions and the per-proxy relationship cache

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use virtmgmt_core_interface::ObjectPath;

use crate::error::{Error, Result};
use crate::locks;
use crate::query::{self, WalkFilter};

/// How related objects are found
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// `ASSOCIATORS OF` walk through an association class
    Walk {
        association_class: String,
        result_class: Option<String>,
        source_role: Option<String>,
        result_role: Option<String>,
    },
    /// Free query. `{path}`, `{server}` and `{key:Name}` are substituted from
    /// the source identity.
    Query { template: String },
}

/// A named relationship from one object to others
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Association {
    name: String,
    kind: AssociationKind,
    do_not_cache: bool,
    explicit_name: bool,
}

impl Association {
    /// Walk through `association_class`; named after it unless renamed
    pub fn walk(association_class: impl Into<String>) -> Self {
        let association_class = association_class.into();
        Self {
            name: association_class.clone(),
            kind: AssociationKind::Walk {
                association_class,
                result_class: None,
                source_role: None,
                result_role: None,
            },
            do_not_cache: false,
            explicit_name: false,
        }
    }

    pub fn query(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::Query {
                template: template.into(),
            },
            do_not_cache: false,
            explicit_name: false,
        }
    }

    /// Fix the name; later qualifiers no longer change it
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.explicit_name = true;
        self
    }

    pub fn result_class(mut self, class: impl Into<String>) -> Self {
        if let AssociationKind::Walk { result_class, .. } = &mut self.kind {
            *result_class = Some(class.into());
        }
        self.rename_from_parts()
    }

    pub fn result_role(mut self, role: impl Into<String>) -> Self {
        if let AssociationKind::Walk { result_role, .. } = &mut self.kind {
            *result_role = Some(role.into());
        }
        self.rename_from_parts()
    }

    pub fn source_role(mut self, role: impl Into<String>) -> Self {
        if let AssociationKind::Walk { source_role, .. } = &mut self.kind {
            *source_role = Some(role.into());
        }
        self.rename_from_parts()
    }

    /// Re-query on every access
    pub fn do_not_cache(mut self) -> Self {
        self.do_not_cache = true;
        self
    }

    // walks sharing an association class but differing in qualifiers must
    // not share a cache slot
    fn rename_from_parts(mut self) -> Self {
        if self.explicit_name {
            return self;
        }
        if let AssociationKind::Walk {
            association_class,
            result_class,
            source_role,
            result_role,
        } = &self.kind
        {
            let mut name = association_class.clone();
            for part in [result_class, source_role, result_role].into_iter().flatten() {
                name.push('/');
                name.push_str(part);
            }
            self.name = name;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &AssociationKind {
        &self.kind
    }

    pub fn is_do_not_cache(&self) -> bool {
        self.do_not_cache
    }

    /// Query text for the objects related to `source`
    pub fn build_query(&self, source: &ObjectPath) -> Result<String> {
        match &self.kind {
            AssociationKind::Walk {
                association_class,
                result_class,
                source_role,
                result_role,
            } => Ok(query::associators_of(
                source,
                association_class,
                &WalkFilter {
                    result_class: result_class.as_deref(),
                    result_role: result_role.as_deref(),
                    role: source_role.as_deref(),
                },
            )),
            AssociationKind::Query { template } => substitute(template, source),
        }
    }
}

fn substitute(template: &str, source: &ObjectPath) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            Error::invalid_value("association template", template, "balanced '{' and '}'")
        })?;
        let placeholder = &after[..end];

        match placeholder {
            "path" => out.push_str(&query::escape_string(&source.to_string())),
            "server" => out.push_str(&query::escape_string(source.server())),
            other => {
                let key_name = other.strip_prefix("key:").ok_or_else(|| {
                    Error::invalid_value(
                        "association template",
                        other,
                        "{path}, {server} or {key:Name}",
                    )
                })?;
                let value = source.key(key_name).ok_or_else(|| {
                    Error::invalid_value(
                        key_name,
                        source.to_string(),
                        "a source identity with this key",
                    )
                })?;
                match value.as_str() {
                    Some(s) => out.push_str(&query::escape_string(s)),
                    None => out.push_str(&value.to_string()),
                }
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Cached result of one association
#[derive(Debug, Clone)]
pub struct AssociationEntry {
    pub related: Arc<Vec<ObjectPath>>,
    pub last_refreshed: Instant,
}

#[derive(Debug, Default)]
pub struct AssociationCache {
    entries: RwLock<HashMap<String, AssociationEntry>>,
}

impl AssociationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, association: &Association) -> Option<AssociationEntry> {
        locks::read(&self.entries).get(association.name()).cloned()
    }

    pub fn needs_refresh(&self, association: &Association, threshold: Duration) -> bool {
        if association.is_do_not_cache() {
            return true;
        }
        match locks::read(&self.entries).get(association.name()) {
            Some(entry) => entry.last_refreshed.elapsed() > threshold,
            None => true,
        }
    }

    /// Store a freshly queried list, dropping duplicates but keeping order
    pub fn store(
        &self,
        association: &Association,
        related: Vec<ObjectPath>,
    ) -> Arc<Vec<ObjectPath>> {
        let mut seen = HashSet::new();
        let related: Vec<ObjectPath> = related
            .into_iter()
            .filter(|path| seen.insert(path.clone()))
            .collect();
        let related = Arc::new(related);

        locks::write(&self.entries).insert(
            association.name().to_string(),
            AssociationEntry {
                related: related.clone(),
                last_refreshed: Instant::now(),
            },
        );
        related
    }

    pub fn invalidate(&self, association: &Association) {
        locks::write(&self.entries).remove(association.name());
    }

    pub fn invalidate_all(&self) {
        locks::write(&self.entries).clear();
    }
}

/// Relationships the object model itself walks
pub mod associations {
    use super::Association;

    /// Job to the objects it affects
    pub fn affected_job_element() -> Association {
        Association::walk("Msvm_AffectedJobElement").result_role("AffectedElement")
    }

    /// Affected object to its jobs
    pub fn element_jobs() -> Association {
        Association::walk("Msvm_AffectedJobElement").result_role("AffectingElement")
    }

    pub fn system_device(result_class: &str) -> Association {
        Association::walk("Msvm_SystemDevice").result_class(result_class)
    }

    pub fn settings_define_state(result_class: &str) -> Association {
        Association::walk("Msvm_SettingsDefineState").result_class(result_class)
    }

    pub fn element_setting_data(result_class: &str) -> Association {
        Association::walk("Msvm_ElementSettingData").result_class(result_class)
    }

    /// Summary information changes constantly server side
    pub fn system_to_summary() -> Association {
        Association::walk("Msvm_ComputerSystemSummaryInformation")
            .result_class("Msvm_SummaryInformation")
            .do_not_cache()
    }

    /// Every job on the server, independent of the source object
    pub fn query_tasks() -> Association {
        Association::query("QueryTasks", "SELECT * FROM CIM_ConcreteJob")
    }
}
