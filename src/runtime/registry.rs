//! Versioned registries for workflow and activity handlers.
//!
//! Both kinds share one generic `Registry<H>`: a name maps to a
//! `BTreeMap<Version, handler>` so `Latest` resolution is the map's last
//! entry. Activities are always registered at 1.0.0 with `Latest` policy;
//! workflows may register multiple versions, which must be added in
//! increasing order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use semver::Version;

use crate::codec;
use crate::error::{ActivityError, FailureInfo};
use crate::{Event, WorkflowContext};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, FailureInfo>;

    /// Workflow-specific status projection over the instance history.
    /// Returned JSON lands in the snapshot's `detail` field.
    fn project(&self, _history: &[Event]) -> Option<String> {
        None
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

type Projector = dyn Fn(&[Event]) -> Option<String> + Send + Sync;

pub struct FnWorkflow<F> {
    f: F,
    projector: Option<Arc<Projector>>,
}

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<String, FailureInfo>> + Send,
{
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, FailureInfo> {
        (self.f)(ctx, input).await
    }

    fn project(&self, history: &[Event]) -> Option<String> {
        self.projector.as_ref().and_then(|p| p(history))
    }
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

#[derive(Clone, Debug)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub type WorkflowRegistry = Registry<dyn WorkflowHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type WorkflowRegistryBuilder = RegistryBuilder<dyn WorkflowHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Resolve a handler by name using the configured version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self
            .policy
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);
        let result = match &pol {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|m| m.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            tracing::debug!(
                target: "ordex::runtime::registry",
                requested_name = %name,
                requested_policy = ?pol,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        result
    }

    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        self.inner.get(name).and_then(|m| m.get(v)).cloned()
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy.lock().unwrap().insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, surfacing duplicate-registration errors instead of silently
    /// keeping the first handler.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn check_duplicate(&mut self, name: &str, version: &Version, what: &str) -> bool {
        let entry = self.map.entry(name.to_string()).or_default();
        if entry.contains_key(version) {
            self.errors.push(format!("duplicate {what} registration: {name}@{version}"));
            true
        } else {
            false
        }
    }

    fn insert(&mut self, name: String, version: Version, handler: Arc<H>, what: &str) {
        if self.check_duplicate(&name, &version, what) {
            return;
        }
        let entry = self.map.entry(name.clone()).or_default();
        if let Some((latest, _)) = entry.iter().next_back() {
            if &version <= latest {
                panic!("non-monotonic {what} version for {name}: {version} is not later than {latest}");
            }
        }
        entry.insert(version, handler);
    }
}

impl WorkflowRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, FailureInfo>> + Send + 'static,
    {
        self.register_versioned(name, "1.0.0", f)
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: &str, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, FailureInfo>> + Send + 'static,
    {
        let v = Version::parse(version).expect("workflow version must be valid semver");
        self.insert(name.into(), v, Arc::new(FnWorkflow { f, projector: None }), "workflow");
        self
    }

    /// Register with typed input/output plus a status projector.
    pub fn register_projected<In, Out, F, Fut, P>(mut self, name: impl Into<String>, f: F, projector: P) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, FailureInfo>> + Send + 'static,
        P: Fn(&[Event]) -> Option<String> + Send + Sync + 'static,
    {
        let wrapper = typed_workflow(f);
        self.insert(
            name.into(),
            DEFAULT_VERSION,
            Arc::new(FnWorkflow {
                f: wrapper,
                projector: Some(Arc::new(projector)),
            }),
            "workflow",
        );
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, FailureInfo>> + Send + 'static,
    {
        let wrapper = typed_workflow(f);
        self.insert(
            name.into(),
            DEFAULT_VERSION,
            Arc::new(FnWorkflow { f: wrapper, projector: None }),
            "workflow",
        );
        self
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

fn typed_workflow<In, Out, F, Fut>(
    f: F,
) -> impl Fn(WorkflowContext, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, FailureInfo>> + Send>>
       + Send
       + Sync
       + 'static
where
    In: serde::de::DeserializeOwned + Send + 'static,
    Out: serde::Serialize + Send + 'static,
    F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<Out, FailureInfo>> + Send + 'static,
{
    move |ctx: WorkflowContext, input_s: String| {
        let f = f.clone();
        Box::pin(async move {
            let input: In = codec::decode(&input_s).map_err(FailureInfo::permanent)?;
            let out: Out = f(ctx, input).await?;
            codec::encode(&out).map_err(FailureInfo::permanent)
        })
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        let name = name.into();
        self.insert(name.clone(), DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity");
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        let wrapper = move |input_s: String| {
            let f = f.clone();
            async move {
                let input: In = codec::decode(&input_s).map_err(ActivityError::permanent)?;
                let out: Out = f(input).await?;
                codec::encode(&out).map_err(ActivityError::permanent)
            }
        };
        self.register(name, wrapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_policy_resolves_highest_version() {
        let reg = WorkflowRegistry::builder()
            .register_versioned("wf", "1.0.0", |_ctx, _in| async { Ok("v1".to_string()) })
            .register_versioned("wf", "1.1.0", |_ctx, _in| async { Ok("v2".to_string()) })
            .build();
        let (v, _) = reg.resolve_handler("wf").unwrap();
        assert_eq!(v, Version::new(1, 1, 0));
    }

    #[test]
    fn exact_policy_pins_version() {
        let reg = WorkflowRegistry::builder()
            .register_versioned("wf", "1.0.0", |_ctx, _in| async { Ok("v1".to_string()) })
            .register_versioned("wf", "1.1.0", |_ctx, _in| async { Ok("v2".to_string()) })
            .build();
        reg.set_version_policy("wf", VersionPolicy::Exact(Version::new(1, 0, 0)));
        let (v, _) = reg.resolve_handler("wf").unwrap();
        assert_eq!(v, Version::new(1, 0, 0));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let res = ActivityRegistry::builder()
            .register("A", |_in| async { Ok(String::new()) })
            .register("A", |_in| async { Ok(String::new()) })
            .build_result();
        let err = res.err().unwrap();
        assert!(err.contains("duplicate activity registration"), "{err}");
    }

    #[test]
    #[should_panic(expected = "non-monotonic")]
    fn out_of_order_versions_panic() {
        let _ = WorkflowRegistry::builder()
            .register_versioned("wf", "2.0.0", |_ctx, _in| async { Ok(String::new()) })
            .register_versioned("wf", "1.0.0", |_ctx, _in| async { Ok(String::new()) });
    }

    #[test]
    fn unknown_name_resolves_none() {
        let reg = ActivityRegistry::builder().build();
        assert!(reg.resolve_handler("missing").is_none());
    }
}
