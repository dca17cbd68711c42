//! # Proxy Builder
//!
//! Turns a declarative description of a remote service into a callable `Proxy`.
//!
//! ## Philosophy
//!
//! - **Explicit**: every method is described up front (return shape, convention,
//!   parameter roles, routing). Nothing is discovered at call time.
//! - **Validate once**: `ProxyBuilder::build` rejects inconsistent descriptions and
//!   prepares one plan per method. `Proxy::call` only checks arguments against the plan.
//! - **Local stays local**: methods with a local handler never touch the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::warn;

use elwire::ApplicationId;
use elwire::DispatchType;
use elwire::Invocation;
use elwire::NodeId;

use crate::error::ClusterError;
use crate::error::Result;
use crate::invoker::Callbacks;
use crate::invoker::Executor;
use crate::invoker::RedirectingInvoker;
use crate::invoker::RemoteInvoker;
use crate::invoker::Request;
use crate::invoker::ReturnShape;
use crate::invoker::Staged;
use crate::invoker::resolve_hybrid;
use crate::registry::InvokerSource;

/// How a parameter is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Serialized into the invocation.
    Argument,
    /// A NodeId that both travels as an argument and may pick the target.
    Address,
    /// Receives one result part. The n-th handler takes part n.
    ResultHandler,
    /// Receives the first error of the call.
    ErrorHandler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub type_name: String,
    pub role: ParamRole,
}

/// How the target instance is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// The best instance hosting the application.
    Application(ApplicationId),
    /// The node named by the first `Address` argument.
    Node,
}

impl Routing {
    fn tag(&self) -> &'static str {
        match self {
            Routing::Application(_) => "application",
            Routing::Node => "node",
        }
    }
}

pub type LocalHandler = Arc<dyn Fn(Vec<Arg>) -> Result<CallOutcome> + Send + Sync>;

enum MethodKind {
    Remote { dispatch: DispatchType, routing: Routing },
    Local(LocalHandler),
}

pub struct MethodDescriptor {
    name: String,
    shape: ReturnShape,
    params: Vec<Param>,
    kind: MethodKind,
}

impl MethodDescriptor {
    /// A remote method, routed to the best instance of its application by default.
    pub fn remote(name: impl Into<String>, shape: ReturnShape, dispatch: DispatchType, routing: Routing) -> Self {
        Self {
            name: name.into(),
            shape,
            params: Vec::new(),
            kind: MethodKind::Remote { dispatch, routing },
        }
    }

    /// A convenience method answered in-process.
    pub fn local<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Arg>) -> Result<CallOutcome> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            shape: ReturnShape::Value,
            params: Vec::new(),
            kind: MethodKind::Local(Arc::new(handler)),
        }
    }

    pub fn param(mut self, type_name: impl Into<String>, role: ParamRole) -> Self {
        self.params.push(Param { type_name: type_name.into(), role });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct ServiceDescriptor {
    type_name: String,
    instance_name: Option<String>,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self { type_name: type_name.into(), instance_name: None, methods: Vec::new() }
    }

    pub fn named(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = Some(instance_name.into());
        self
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }
}

/// One call argument, matching its parameter's role.
pub enum Arg {
    Value(Vec<u8>),
    Address(NodeId),
    Result(Box<dyn FnOnce(Vec<u8>) + Send + Sync>),
    Error(Arc<dyn Fn(ClusterError) + Send + Sync>),
}

impl Arg {
    pub fn value(bytes: impl Into<Vec<u8>>) -> Self {
        Arg::Value(bytes.into())
    }

    pub fn on_result<F>(f: F) -> Self
    where
        F: FnOnce(Vec<u8>) + Send + Sync + 'static,
    {
        Arg::Result(Box::new(f))
    }

    pub fn on_error<F>(f: F) -> Self
    where
        F: Fn(ClusterError) + Send + Sync + 'static,
    {
        Arg::Error(Arc::new(f))
    }

    fn role(&self) -> ParamRole {
        match self {
            Arg::Value(_) => ParamRole::Argument,
            Arg::Address(_) => ParamRole::Address,
            Arg::Result(_) => ParamRole::ResultHandler,
            Arg::Error(_) => ParamRole::ErrorHandler,
        }
    }
}

impl std::fmt::Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Value(bytes) => write!(f, "Value({} bytes)", bytes.len()),
            Arg::Address(node) => write!(f, "Address({})", node),
            Arg::Result(_) => f.write_str("Result(..)"),
            Arg::Error(_) => f.write_str("Error(..)"),
        }
    }
}

/// What a call hands back, by convention.
pub enum CallOutcome {
    /// Void method, or callback convention: results arrive through handlers.
    Sent,
    /// Synchronous value or local answer.
    Value(Vec<u8>),
    Request(Request),
    Staged(Staged),
}

impl CallOutcome {
    pub fn into_value(self) -> Result<Vec<u8>> {
        match self {
            CallOutcome::Value(v) => Ok(v),
            _ => Err(ClusterError::illegal_state("Call did not produce an immediate value.")),
        }
    }
}

struct RemotePlan {
    type_name: String,
    instance_name: Option<String>,
    method: String,
    shape: ReturnShape,
    params: Vec<Param>,
    dispatch: DispatchType,
    routing: Routing,
}

enum MethodPlan {
    Remote(RemotePlan),
    Local { params: usize, handler: LocalHandler },
}

/// Validates descriptors and builds proxies over an invoker source.
pub struct ProxyBuilder {
    executor: Option<Arc<dyn Executor>>,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self { executor: None }
    }

    /// Runs every callback of the built proxy on `executor`.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(&self, service: ServiceDescriptor, source: Arc<dyn InvokerSource>) -> Result<Proxy> {
        let mut plans = HashMap::with_capacity(service.methods.len());
        for method in service.methods {
            if plans.contains_key(&method.name) {
                return Err(ClusterError::Config(format!("Duplicate method {}", method.name)));
            }
            let plan = match method.kind {
                MethodKind::Local(handler) => MethodPlan::Local { params: method.params.len(), handler },
                MethodKind::Remote { dispatch, routing } => {
                    let dispatch = resolve_hybrid(&method.name, dispatch, method.shape);
                    validate(&method.name, method.shape, dispatch, routing, &method.params)?;
                    MethodPlan::Remote(RemotePlan {
                        type_name: service.type_name.clone(),
                        instance_name: service.instance_name.clone(),
                        method: method.name.clone(),
                        shape: method.shape,
                        params: method.params,
                        dispatch,
                        routing,
                    })
                }
            };
            plans.insert(method.name, Arc::new(plan));
        }

        Ok(Proxy {
            type_name: service.type_name,
            plans,
            source,
            executor: self.executor.clone(),
        })
    }
}

fn validate(name: &str, shape: ReturnShape, dispatch: DispatchType, routing: Routing, params: &[Param]) -> Result<()> {
    let invalid = |why: &str| Err(ClusterError::Config(format!("Method {}: {}", name, why)));

    let handlers = params.iter().filter(|p| matches!(p.role, ParamRole::ResultHandler)).count();
    let error_handlers = params.iter().filter(|p| p.role == ParamRole::ErrorHandler).count();
    let addresses = params.iter().filter(|p| p.role == ParamRole::Address).count();

    match (dispatch, shape) {
        (DispatchType::Synchronous, ReturnShape::Value | ReturnShape::Void) => {}
        (DispatchType::Callback, ReturnShape::Void) => {}
        (DispatchType::Future | DispatchType::Staged, ReturnShape::Pending) => {}
        (dispatch, shape) => return invalid(&format!("{:?} dispatch cannot return {:?}", dispatch, shape)),
    }
    if (handlers > 0 || error_handlers > 0) && !matches!(dispatch, DispatchType::Callback | DispatchType::Future) {
        return invalid("handler parameters need callback or future dispatch");
    }
    if error_handlers > 1 {
        return invalid("more than one error handler");
    }
    if routing == Routing::Node && addresses == 0 {
        return invalid("node routing needs an address parameter");
    }
    Ok(())
}

/// Delivers only the first error; later ones are logged.
fn first_error_only(method: String, handler: Arc<dyn Fn(ClusterError) + Send + Sync>) -> impl Fn(u32, ClusterError) + Send + Sync {
    let delivered = AtomicBool::new(false);
    move |part, error| {
        if delivered.swap(true, Ordering::AcqRel) {
            warn!(method = %method, part, error = %error, "Suppressing additional errors.");
        } else {
            handler(error);
        }
    }
}

/// A callable view of one remote service.
pub struct Proxy {
    type_name: String,
    plans: HashMap<String, Arc<MethodPlan>>,
    source: Arc<dyn InvokerSource>,
    executor: Option<Arc<dyn Executor>>,
}

impl Proxy {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plans.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub async fn call(&self, method: &str, args: Vec<Arg>) -> Result<CallOutcome> {
        let plan = self
            .plans
            .get(method)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(format!("{}::{}", self.type_name, method)))?;

        match plan.as_ref() {
            MethodPlan::Local { params, handler } => {
                if args.len() != *params {
                    return Err(ClusterError::illegal_state(format!(
                        "{} takes {} arguments, got {}",
                        method,
                        params,
                        args.len()
                    )));
                }
                handler(args)
            }
            MethodPlan::Remote(plan) => self.call_remote(plan, args).await,
        }
    }

    async fn call_remote(&self, plan: &RemotePlan, args: Vec<Arg>) -> Result<CallOutcome> {
        if args.len() != plan.params.len() {
            return Err(ClusterError::illegal_state(format!(
                "{} takes {} arguments, got {}",
                plan.method,
                plan.params.len(),
                args.len()
            )));
        }

        let mut invocation = Invocation::new(&plan.type_name, &plan.method)
            .with_dispatch(plan.dispatch)
            .with_routing(plan.routing.tag());
        if let Some(name) = &plan.instance_name {
            invocation = invocation.with_name(name);
        }

        let mut callbacks = Callbacks::new();
        let mut target: Option<NodeId> = None;
        let mut next_part = 1u32;

        for (index, (param, arg)) in plan.params.iter().zip(args).enumerate() {
            if param.role != arg.role() {
                return Err(ClusterError::illegal_state(format!(
                    "{} argument {} must be {:?}, got {:?}",
                    plan.method, index, param.role, arg
                )));
            }
            match arg {
                Arg::Value(bytes) => invocation = invocation.with_argument(&param.type_name, bytes),
                Arg::Address(node) => {
                    target.get_or_insert(node);
                    invocation = invocation.with_argument(&param.type_name, node.to_bytes().to_vec());
                }
                Arg::Result(handler) => {
                    callbacks = callbacks.on_part(next_part, handler);
                    next_part += 1;
                }
                Arg::Error(handler) => {
                    callbacks = callbacks.on_error(first_error_only(plan.method.clone(), handler));
                }
            }
        }

        let invoker = match plan.routing {
            Routing::Application(application) => self.source.best_for_application(application)?,
            Routing::Node => {
                let node = target.ok_or_else(|| ClusterError::illegal_state("Node routing without an address"))?;
                self.source.for_node(&node)?
            }
        };

        self.dispatch(plan, invoker, invocation, callbacks).await
    }

    async fn dispatch(
        &self,
        plan: &RemotePlan,
        invoker: Arc<RemoteInvoker>,
        invocation: Invocation,
        callbacks: Callbacks,
    ) -> Result<CallOutcome> {
        let invoker = Dispatch::new(invoker, self.executor.clone());
        match plan.dispatch {
            DispatchType::Synchronous => {
                let value = invoker.invoke_sync(invocation).await?;
                Ok(match plan.shape {
                    ReturnShape::Void => CallOutcome::Sent,
                    _ => CallOutcome::Value(value),
                })
            }
            DispatchType::Callback => {
                invoker.invoke_callback(invocation, callbacks).await?;
                Ok(CallOutcome::Sent)
            }
            DispatchType::Future => Ok(CallOutcome::Request(invoker.invoke_future(invocation, callbacks).await?)),
            DispatchType::Staged => Ok(CallOutcome::Staged(invoker.invoke_staged(invocation).await?)),
            DispatchType::Hybrid => Err(ClusterError::illegal_state("Unresolved hybrid dispatch")),
        }
    }
}

/// The invoker a call goes through: direct, or redirected when the proxy has an
/// executor.
enum Dispatch {
    Direct(Arc<RemoteInvoker>),
    Redirected(RedirectingInvoker),
}

impl Dispatch {
    fn new(invoker: Arc<RemoteInvoker>, executor: Option<Arc<dyn Executor>>) -> Self {
        match executor {
            Some(executor) => Dispatch::Redirected(RedirectingInvoker::new(invoker, executor)),
            None => Dispatch::Direct(invoker),
        }
    }

    async fn invoke_sync(&self, invocation: Invocation) -> Result<Vec<u8>> {
        match self {
            Dispatch::Direct(i) => i.invoke_sync(invocation).await,
            Dispatch::Redirected(i) => i.invoke_sync(invocation).await,
        }
    }

    async fn invoke_callback(&self, invocation: Invocation, callbacks: Callbacks) -> Result<()> {
        match self {
            Dispatch::Direct(i) => i.invoke_callback(invocation, callbacks).await,
            Dispatch::Redirected(i) => i.invoke_callback(invocation, callbacks).await,
        }
    }

    async fn invoke_future(&self, invocation: Invocation, callbacks: Callbacks) -> Result<Request> {
        match self {
            Dispatch::Direct(i) => i.invoke_future(invocation, callbacks).await,
            Dispatch::Redirected(i) => i.invoke_future(invocation, callbacks).await,
        }
    }

    async fn invoke_staged(&self, invocation: Invocation) -> Result<Staged> {
        match self {
            Dispatch::Direct(i) => i.invoke_staged(invocation).await,
            Dispatch::Redirected(i) => i.invoke_staged(invocation).await,
        }
    }
}
