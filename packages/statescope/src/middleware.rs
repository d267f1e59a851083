//! Action middleware.
//!
//! Middleware wraps every action a scope runs, including nested dispatches and
//! the builtin `reset` / `restore`. Each middleware receives the input and a
//! [`Next`] handle; calling [`Next::run`] invokes the rest of the chain and
//! finally the action. The first registered middleware runs outermost.
//!
//! ```ignore
//! let clamp = from_fn(|ctx, state: &i64, props, next| {
//!     let value = next.run(state, props)?;
//!     Ok(value.clamp(0, 100))
//! });
//!
//! let scope = Scope::new(ScopeConfig::new(0_i64).with_middleware(clamp));
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::event::Props;
use crate::scope::{Scope, State};

/// A registered action after props erasure.
pub type ActionFn<T> = Arc<dyn Fn(&T, &Props) -> anyhow::Result<T> + Send + Sync>;

/// What is being dispatched.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub scope_name: &'a str,
    pub store_name: Option<&'a str>,
    pub action_name: &'a str,
    /// True if this dispatch runs inside another dispatch of the same scope.
    pub is_nested: bool,
}

/// Wraps action execution.
pub trait Middleware<T: State>: Send + Sync + 'static {
    /// Run the action through `next`, optionally altering input or output.
    fn handle(
        &self,
        ctx: &ActionContext<'_>,
        state: &T,
        props: &Props,
        next: Next<'_, T>,
    ) -> anyhow::Result<T>;

    /// Called once, after the scope has been created and registered.
    fn setup(&self, _scope: &Scope<T>) {}
}

/// The remainder of a middleware chain.
pub struct Next<'a, T: State> {
    ctx: &'a ActionContext<'a>,
    chain: &'a [Arc<dyn Middleware<T>>],
    action: &'a ActionFn<T>,
}

impl<'a, T: State> Next<'a, T> {
    pub(crate) fn new(
        ctx: &'a ActionContext<'a>,
        chain: &'a [Arc<dyn Middleware<T>>],
        action: &'a ActionFn<T>,
    ) -> Self {
        Self { ctx, chain, action }
    }

    /// Invoke the inner middleware, or the action when none is left.
    pub fn run(self, state: &T, props: &Props) -> anyhow::Result<T> {
        match self.chain.split_first() {
            Some((outer, rest)) => outer.handle(
                self.ctx,
                state,
                props,
                Next {
                    ctx: self.ctx,
                    chain: rest,
                    action: self.action,
                },
            ),
            None => (self.action)(state, props),
        }
    }
}

// =============================================================================
// Closure Middleware
// =============================================================================

struct FnMiddleware<F>(F);

impl<T, F> Middleware<T> for FnMiddleware<F>
where
    T: State,
    F: Fn(&ActionContext<'_>, &T, &Props, Next<'_, T>) -> anyhow::Result<T> + Send + Sync + 'static,
{
    fn handle(
        &self,
        ctx: &ActionContext<'_>,
        state: &T,
        props: &Props,
        next: Next<'_, T>,
    ) -> anyhow::Result<T> {
        (self.0)(ctx, state, props, next)
    }
}

/// Build a middleware from a closure.
pub fn from_fn<T, F>(f: F) -> Arc<dyn Middleware<T>>
where
    T: State,
    F: Fn(&ActionContext<'_>, &T, &Props, Next<'_, T>) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(FnMiddleware(f))
}

// =============================================================================
// Tracing Middleware
// =============================================================================

/// Logs every action with its duration at `debug` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

impl<T: State> Middleware<T> for TracingMiddleware {
    fn handle(
        &self,
        ctx: &ActionContext<'_>,
        state: &T,
        props: &Props,
        next: Next<'_, T>,
    ) -> anyhow::Result<T> {
        let started = Instant::now();
        let result = next.run(state, props);
        debug!(
            scope = %ctx.scope_name,
            store = ?ctx.store_name,
            action = %ctx.action_name,
            nested = ctx.is_nested,
            ok = result.is_ok(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "action finished"
        );
        result
    }

    fn setup(&self, scope: &Scope<T>) {
        debug!(scope = %scope.name(), "tracing middleware attached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::props;
    use std::sync::Mutex;

    fn ctx() -> ActionContext<'static> {
        ActionContext {
            scope_name: "counter",
            store_name: None,
            action_name: "increment",
            is_nested: false,
        }
    }

    fn recorder(tag: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware<i64>> {
        from_fn(move |_ctx, state: &i64, props, next| {
            log.lock().unwrap().push(format!("{tag}:before"));
            let result = next.run(state, props);
            log.lock().unwrap().push(format!("{tag}:after"));
            result
        })
    }

    #[test]
    fn test_first_registered_runs_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![recorder("a", log.clone()), recorder("b", log.clone())];
        let action_log = log.clone();
        let action: ActionFn<i64> = Arc::new(move |state: &i64, _: &Props| -> anyhow::Result<i64> {
            action_log.lock().unwrap().push("action".into());
            Ok(state + 1)
        });

        let ctx = ctx();
        let result = Next::new(&ctx, &chain, &action).run(&1, &props(())).unwrap();

        assert_eq!(result, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before", "b:before", "action", "b:after", "a:after"]
        );
    }

    #[test]
    fn test_middleware_can_short_circuit_and_rewrite() {
        let chain = vec![
            from_fn(|_ctx, state: &i64, props, next| Ok(next.run(state, props)? * 10)),
            from_fn(|ctx, _state: &i64, _props, _next| {
                anyhow::bail!("{} blocked", ctx.action_name)
            }),
        ];
        let action: ActionFn<i64> = Arc::new(|state: &i64, _: &Props| -> anyhow::Result<i64> { Ok(*state) });

        let ctx = ctx();
        let err = Next::new(&ctx, &chain, &action)
            .run(&1, &props(()))
            .unwrap_err();
        assert_eq!(err.to_string(), "increment blocked");

        let value = Next::new(&ctx, &chain[..1], &action)
            .run(&4, &props(()))
            .unwrap();
        assert_eq!(value, 40);
    }

    #[test]
    fn test_empty_chain_runs_action() {
        let action: ActionFn<i64> = Arc::new(|state: &i64, props: &Props| -> anyhow::Result<i64> {
            Ok(state + props.downcast_ref::<i64>().copied().unwrap_or(0))
        });
        let ctx = ctx();
        let chain: Vec<Arc<dyn Middleware<i64>>> = vec![Arc::new(TracingMiddleware)];
        assert_eq!(Next::new(&ctx, &chain, &action).run(&1, &props(2_i64)).unwrap(), 3);
        assert_eq!(Next::new(&ctx, &[], &action).run(&1, &props(5_i64)).unwrap(), 6);
    }
}
