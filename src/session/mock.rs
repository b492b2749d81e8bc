//! In-memory [`Session`] for tests and demos
//!
//! Holds instances, class schemas and association links, evaluates the small
//! subset of WQL the object model generates, and records every call so tests
//! can assert on remote traffic. Event subscriptions are backed by channels;
//! dropping the returned stream is recorded as an unsubscribe.

use async_trait::async_trait;
use futures::Stream;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use virtmgmt_core_interface::{
    eq_fold, ClassSchema, EventKind, EventStream, Instance, InstanceEvent, KeyValue,
    MethodOutput, NativeErrorCode, ObjectPath, QueryDialect, Result, Session, SessionError, Value,
};

use crate::locks;

static SELECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SELECT \* FROM (\w+)(?: WHERE \((.*)\))?$").unwrap());
static ASSOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^ASSOCIATORS OF \{(.+)\} WHERE AssocClass = (\w+)(?: ResultClass = (\w+))?(?: ResultRole = (\w+))?(?: Role = (\w+))?$",
    )
    .unwrap()
});
static CLAUSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+) (=|LIKE) '((?:[^'\\]|\\.)*)'$").unwrap());
static ISA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"TargetInstance ISA '([^']+)'").unwrap());
static KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"TargetInstance\.(\w+) = ('(?:[^'\\]|\\.)*'|-?\d+)").unwrap()
});

/// Session operations that can be counted and failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    GetInstance,
    GetClass,
    Enumerate,
    Query,
    Invoke,
    Modify,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionRecord {
    Subscribed(String),
    Unsubscribed(String),
}

pub type InvokeHandler =
    Arc<dyn Fn(&ObjectPath, &[(String, Value)]) -> Result<MethodOutput> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeCall {
    pub path: ObjectPath,
    pub method: String,
    pub args: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyCall {
    pub path: ObjectPath,
    pub properties: Vec<(String, Value)>,
}

struct Link {
    source: ObjectPath,
    association_class: String,
    target: ObjectPath,
    result_role: Option<String>,
}

struct Feed {
    query: String,
    tx: mpsc::UnboundedSender<Result<InstanceEvent>>,
}

#[derive(Default)]
struct State {
    instances: Vec<Instance>,
    schemas: HashMap<String, ClassSchema>,
    links: Vec<Link>,
    one_shot: HashMap<MockOp, VecDeque<SessionError>>,
    always: HashMap<MockOp, SessionError>,
    calls: HashMap<MockOp, usize>,
    feeds: HashMap<u64, Feed>,
    next_feed: u64,
    subscription_log: Vec<SubscriptionRecord>,
    invoke_handlers: HashMap<String, InvokeHandler>,
    invokes: Vec<InvokeCall>,
    modifies: Vec<ModifyCall>,
    queries: Vec<String>,
}

struct Inner {
    server: String,
    state: Mutex<State>,
}

/// Cloneable handle; all clones share one in-memory server
#[derive(Clone)]
pub struct MockSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSession")
            .field("server", &self.inner.server)
            .finish_non_exhaustive()
    }
}

impl MockSession {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                server: server.into(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn with_instance(self, instance: Instance) -> Self {
        self.put_instance(instance);
        self
    }

    pub fn with_schema(self, schema: ClassSchema) -> Self {
        self.put_schema(schema);
        self
    }

    /// Store or replace an instance. An empty server is filled in.
    pub fn put_instance(&self, mut instance: Instance) {
        if instance.server.is_empty() {
            instance.server = self.inner.server.clone();
        }
        let path = instance.path();
        let mut state = locks::lock(&self.inner.state);
        match state.instances.iter().position(|i| i.path() == path) {
            Some(idx) => state.instances[idx] = instance,
            None => state.instances.push(instance),
        }
    }

    pub fn remove_instance(&self, path: &ObjectPath) -> Option<Instance> {
        let mut state = locks::lock(&self.inner.state);
        let idx = state.instances.iter().position(|i| i.path() == *path)?;
        Some(state.instances.remove(idx))
    }

    pub fn instance(&self, path: &ObjectPath) -> Option<Instance> {
        locks::lock(&self.inner.state)
            .instances
            .iter()
            .find(|i| i.path() == *path)
            .cloned()
    }

    pub fn put_schema(&self, schema: ClassSchema) {
        locks::lock(&self.inner.state)
            .schemas
            .insert(schema.class_name.to_lowercase(), schema);
    }

    /// Relate `source` to `target` through `association_class`
    pub fn link(&self, source: &ObjectPath, association_class: &str, target: &ObjectPath) {
        self.push_link(source, association_class, target, None);
    }

    /// Like [`link`](Self::link), reachable only when the walk asks for
    /// `result_role` (or for no role at all)
    pub fn link_with_role(
        &self,
        source: &ObjectPath,
        association_class: &str,
        target: &ObjectPath,
        result_role: &str,
    ) {
        self.push_link(source, association_class, target, Some(result_role.to_string()));
    }

    fn push_link(
        &self,
        source: &ObjectPath,
        association_class: &str,
        target: &ObjectPath,
        result_role: Option<String>,
    ) {
        locks::lock(&self.inner.state).links.push(Link {
            source: source.clone(),
            association_class: association_class.to_string(),
            target: target.clone(),
            result_role,
        });
    }

    pub fn on_invoke<F>(&self, method: &str, handler: F)
    where
        F: Fn(&ObjectPath, &[(String, Value)]) -> Result<MethodOutput> + Send + Sync + 'static,
    {
        locks::lock(&self.inner.state)
            .invoke_handlers
            .insert(method.to_lowercase(), Arc::new(handler));
    }

    /// Fail the next call of `op` with `err`; queued failures are used in order
    pub fn fail_next(&self, op: MockOp, err: SessionError) {
        locks::lock(&self.inner.state)
            .one_shot
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn fail_always(&self, op: MockOp, err: SessionError) {
        locks::lock(&self.inner.state).always.insert(op, err);
    }

    pub fn clear_failures(&self) {
        let mut state = locks::lock(&self.inner.state);
        state.one_shot.clear();
        state.always.clear();
    }

    pub fn calls(&self, op: MockOp) -> usize {
        locks::lock(&self.inner.state)
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    pub fn subscribe_count(&self) -> usize {
        self.count_records(|r| matches!(r, SubscriptionRecord::Subscribed(_)))
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.count_records(|r| matches!(r, SubscriptionRecord::Unsubscribed(_)))
    }

    fn count_records(&self, pred: impl Fn(&SubscriptionRecord) -> bool) -> usize {
        locks::lock(&self.inner.state)
            .subscription_log
            .iter()
            .filter(|r| pred(r))
            .count()
    }

    pub fn subscription_log(&self) -> Vec<SubscriptionRecord> {
        locks::lock(&self.inner.state).subscription_log.clone()
    }

    /// Query text of every subscription still open
    pub fn active_subscriptions(&self) -> Vec<String> {
        let state = locks::lock(&self.inner.state);
        let mut ids: Vec<_> = state.feeds.keys().copied().collect();
        ids.sort_unstable();
        ids.iter().map(|id| state.feeds[id].query.clone()).collect()
    }

    pub fn invocations(&self) -> Vec<InvokeCall> {
        locks::lock(&self.inner.state).invokes.clone()
    }

    pub fn modifications(&self) -> Vec<ModifyCall> {
        locks::lock(&self.inner.state).modifies.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        locks::lock(&self.inner.state).queries.clone()
    }

    /// Deliver an event to every subscription whose query selects it.
    /// Returns the number of streams it was delivered to.
    pub fn emit(&self, kind: EventKind, target: Instance, previous: Option<Instance>) -> usize {
        let event = InstanceEvent {
            kind,
            target,
            previous,
        };
        self.deliver(|query| event_matches(query, &event), Ok(event.clone()))
    }

    /// Deliver to every subscription whose query text contains `fragment`
    pub fn emit_matching(&self, fragment: &str, event: Result<InstanceEvent>) -> usize {
        self.deliver(|query| query.contains(fragment), event)
    }

    fn deliver(&self, selects: impl Fn(&str) -> bool, event: Result<InstanceEvent>) -> usize {
        let state = locks::lock(&self.inner.state);
        state
            .feeds
            .values()
            .filter(|feed| selects(&feed.query))
            .filter(|feed| feed.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Store `instance` and emit the matching modification event
    pub fn update_and_emit(&self, instance: Instance) -> usize {
        let previous = self.instance(&instance.path());
        self.put_instance(instance.clone());
        self.emit(EventKind::Modified, instance, previous)
    }

    /// Remove the instance and emit the matching deletion event
    pub fn delete_and_emit(&self, path: &ObjectPath) -> usize {
        match self.remove_instance(path) {
            Some(instance) => self.emit(EventKind::Deleted, instance, None),
            None => 0,
        }
    }

    fn begin(&self, op: MockOp) -> Result<()> {
        let mut state = locks::lock(&self.inner.state);
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = state.one_shot.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        match state.always.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = locks::lock(&self.inner.state);
        if let Some(feed) = state.feeds.remove(&id) {
            state
                .subscription_log
                .push(SubscriptionRecord::Unsubscribed(feed.query));
        }
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn parse_literal(literal: &str) -> Option<KeyValue> {
    match literal.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        Some(quoted) => Some(KeyValue::Str(unescape(quoted))),
        None => literal.parse::<i64>().ok().map(KeyValue::Int),
    }
}

fn event_matches(query: &str, event: &InstanceEvent) -> bool {
    if !query.contains(event.kind.event_class()) {
        return false;
    }
    let class_matches = ISA_RE
        .captures(query)
        .is_some_and(|cap| eq_fold(&cap[1], &event.target.class_name));
    class_matches
        && KEY_RE.captures_iter(query).all(|cap| {
            let expected = parse_literal(&cap[2]);
            let actual = event.target.get(&cap[1]).and_then(Value::to_key_value);
            expected.is_some() && actual == expected
        })
}

fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '[' => {
                let inner: String = chars.by_ref().take_while(|&ch| ch != ']').collect();
                if inner.chars().count() == 1 {
                    out.push_str(&regex::escape(&inner));
                } else {
                    out.push('[');
                    out.push_str(&inner);
                    out.push(']');
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

struct Clause {
    property: String,
    pattern: Regex,
}

impl Clause {
    fn parse(text: &str) -> Result<Clause> {
        let invalid = || SessionError::native(NativeErrorCode::InvalidQuery, text);
        let cap = CLAUSE_RE.captures(text.trim()).ok_or_else(invalid)?;
        let value = &cap[3];
        let pattern = if &cap[2] == "LIKE" {
            like_to_regex(&unescape(value))
        } else {
            format!("(?i)^{}$", regex::escape(&unescape(value)))
        };
        Ok(Clause {
            property: cap[1].to_string(),
            pattern: Regex::new(&pattern).map_err(|_| invalid())?,
        })
    }

    fn matches(&self, instance: &Instance) -> bool {
        let text = match instance.get(&self.property) {
            Some(Value::Str(s)) => s.clone(),
            Some(other) => match other.as_i64() {
                Some(n) => n.to_string(),
                None => return false,
            },
            None => return false,
        };
        self.pattern.is_match(&text)
    }
}

impl State {
    fn select(
        &self,
        namespace: &str,
        class: &str,
        where_clause: Option<&str>,
    ) -> Result<Vec<Instance>> {
        let clauses = match where_clause {
            Some(text) => text
                .split(" OR ")
                .map(Clause::parse)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(self
            .instances
            .iter()
            .filter(|i| eq_fold(&i.namespace, namespace) && eq_fold(&i.class_name, class))
            .filter(|i| clauses.is_empty() || clauses.iter().any(|c| c.matches(i)))
            .cloned()
            .collect())
    }

    fn associators(
        &self,
        source: &ObjectPath,
        association_class: &str,
        result_class: Option<&str>,
        result_role: Option<&str>,
    ) -> Vec<Instance> {
        self.links
            .iter()
            .filter(|l| l.source == *source && eq_fold(&l.association_class, association_class))
            .filter(|l| match (result_role, &l.result_role) {
                (Some(want), Some(have)) => eq_fold(want, have),
                _ => true,
            })
            .filter(|l| result_class.map_or(true, |c| eq_fold(c, l.target.class_name())))
            .filter_map(|l| self.instances.iter().find(|i| i.path() == l.target).cloned())
            .collect()
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<InstanceEvent>>,
    id: u64,
    session: Weak<Inner>,
}

impl Stream for MockStream {
    type Item = Result<InstanceEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            MockSession { inner }.unsubscribe(self.id);
        }
    }
}

#[async_trait]
impl Session for MockSession {
    fn server_name(&self) -> &str {
        &self.inner.server
    }

    async fn get_instance(&self, path: &ObjectPath) -> Result<Instance> {
        self.begin(MockOp::GetInstance)?;
        self.instance(path)
            .ok_or_else(|| SessionError::not_found(path.to_string()))
    }

    async fn get_class(&self, _namespace: &str, class_name: &str) -> Result<ClassSchema> {
        self.begin(MockOp::GetClass)?;
        let state = locks::lock(&self.inner.state);
        if let Some(schema) = state.schemas.get(&class_name.to_lowercase()) {
            return Ok(schema.clone());
        }
        state
            .instances
            .iter()
            .find(|i| eq_fold(&i.class_name, class_name))
            .map(ClassSchema::infer_from)
            .ok_or_else(|| SessionError::native(NativeErrorCode::InvalidClass, class_name))
    }

    async fn enumerate_instances(
        &self,
        namespace: &str,
        class_name: &str,
    ) -> Result<Vec<Instance>> {
        self.begin(MockOp::Enumerate)?;
        locks::lock(&self.inner.state).select(namespace, class_name, None)
    }

    async fn query(
        &self,
        namespace: &str,
        _dialect: QueryDialect,
        text: &str,
    ) -> Result<Vec<Instance>> {
        self.begin(MockOp::Query)?;
        let mut state = locks::lock(&self.inner.state);
        state.queries.push(text.to_string());

        if let Some(cap) = SELECT_RE.captures(text) {
            return state.select(namespace, &cap[1], cap.get(2).map(|m| m.as_str()));
        }
        if let Some(cap) = ASSOC_RE.captures(text) {
            let source: ObjectPath = cap[1]
                .parse()
                .map_err(|_| SessionError::native(NativeErrorCode::InvalidQuery, text))?;
            return Ok(state.associators(
                &source,
                &cap[2],
                cap.get(3).map(|m| m.as_str()),
                cap.get(4).map(|m| m.as_str()),
            ));
        }
        Err(SessionError::native(NativeErrorCode::InvalidQuery, text))
    }

    async fn invoke_method(
        &self,
        path: &ObjectPath,
        method: &str,
        args: &[(String, Value)],
    ) -> Result<MethodOutput> {
        self.begin(MockOp::Invoke)?;
        let handler = {
            let mut state = locks::lock(&self.inner.state);
            state.invokes.push(InvokeCall {
                path: path.clone(),
                method: method.to_string(),
                args: args.to_vec(),
            });
            if let Some(schema) = state.schemas.get(&path.class_name().to_lowercase()) {
                if !schema.has_method(method) {
                    return Err(SessionError::native(NativeErrorCode::MethodNotFound, method));
                }
            }
            state.invoke_handlers.get(&method.to_lowercase()).cloned()
        };
        match handler {
            Some(handler) => handler(path, args),
            None => Ok(MethodOutput::new(0)),
        }
    }

    async fn modify_instance(
        &self,
        path: &ObjectPath,
        properties: &[(String, Value)],
    ) -> Result<()> {
        self.begin(MockOp::Modify)?;
        let mut state = locks::lock(&self.inner.state);
        state.modifies.push(ModifyCall {
            path: path.clone(),
            properties: properties.to_vec(),
        });
        let instance = state
            .instances
            .iter_mut()
            .find(|i| i.path() == *path)
            .ok_or_else(|| SessionError::not_found(path.to_string()))?;
        for (name, value) in properties {
            instance.set(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _namespace: &str,
        _dialect: QueryDialect,
        text: &str,
    ) -> Result<EventStream> {
        self.begin(MockOp::Subscribe)?;
        if !text.starts_with("SELECT * FROM __Instance") {
            return Err(SessionError::native(NativeErrorCode::InvalidQuery, text));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = locks::lock(&self.inner.state);
        let id = state.next_feed;
        state.next_feed += 1;
        state.feeds.insert(
            id,
            Feed {
                query: text.to_string(),
                tx,
            },
        );
        state
            .subscription_log
            .push(SubscriptionRecord::Subscribed(text.to_string()));

        Ok(Box::pin(MockStream {
            rx,
            id,
            session: Arc::downgrade(&self.inner),
        }))
    }
}
