//! Unary handlers and the interceptor hook around them.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tonic::Status;

use crate::context::Context;
use crate::net::ConnectionId;

/// Result of a unary call: the encoded response or a status.
pub type UnaryResult = Result<Bytes, Status>;

/// A registered unary method.
pub type UnaryHandler = Arc<dyn Fn(Context, Bytes) -> BoxFuture<'static, UnaryResult> + Send + Sync>;

/// Box an async function as a [`UnaryHandler`].
pub fn unary_handler<F, Fut>(f: F) -> UnaryHandler
where
    F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = UnaryResult> + Send + 'static,
{
    Arc::new(move |ctx, payload| f(ctx, payload).boxed())
}

/// Describes the call an interceptor is wrapping.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Full method path, e.g. `/echo.EchoService/Echo`.
    pub method: String,
    /// Connection the call arrived on.
    pub connection_id: ConnectionId,
}

/// The rest of the call chain.
pub struct Next {
    handler: UnaryHandler,
}

impl Next {
    pub(crate) fn new(handler: UnaryHandler) -> Self {
        Self { handler }
    }

    /// Invoke the handler.
    pub fn run(self, ctx: Context, payload: Bytes) -> BoxFuture<'static, UnaryResult> {
        (self.handler)(ctx, payload)
    }
}

/// Hook invoked around every unary handler call.
///
/// An interceptor may rewrite the context or payload, short-circuit with a
/// status, pass the call on through `next`, or inspect the result. Unlike
/// `tonic::service::Interceptor` it wraps the whole call, not just the request.
pub trait UnaryInterceptor: Send + Sync + 'static {
    fn intercept(
        &self,
        ctx: Context,
        payload: Bytes,
        info: CallInfo,
        next: Next,
    ) -> BoxFuture<'static, UnaryResult>;
}

impl<F> UnaryInterceptor for F
where
    F: Fn(Context, Bytes, CallInfo, Next) -> BoxFuture<'static, UnaryResult> + Send + Sync + 'static,
{
    fn intercept(
        &self,
        ctx: Context,
        payload: Bytes,
        info: CallInfo,
        next: Next,
    ) -> BoxFuture<'static, UnaryResult> {
        self(ctx, payload, info, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn info() -> CallInfo {
        CallInfo {
            method: "/test.Service/Call".into(),
            connection_id: ConnectionId::new(),
        }
    }

    #[tokio::test]
    async fn closure_interceptor_wraps_handler() {
        let handler = unary_handler(|_ctx, payload: Bytes| async move {
            let mut out = payload.to_vec();
            out.extend_from_slice(b"!");
            Ok(Bytes::from(out))
        });

        let interceptor = |ctx: Context, payload: Bytes, info: CallInfo, next: Next| {
            assert_eq!(info.method, "/test.Service/Call");
            next.run(ctx, payload)
        };

        let out = interceptor
            .intercept(Context::background(), Bytes::from_static(b"hi"), info(), Next::new(handler))
            .await
            .unwrap();
        assert_eq!(&out[..], b"hi!");
    }

    #[tokio::test]
    async fn interceptor_can_short_circuit() {
        let handler = unary_handler(|_ctx, _payload| async move {
            if true {
                panic!("handler must not run");
            }
            Ok(Bytes::new())
        });

        let deny = |_ctx: Context, _payload: Bytes, _info: CallInfo, _next: Next| {
            async { Err::<Bytes, Status>(Status::new(Code::PermissionDenied, "denied")) }.boxed()
        };

        let err = deny
            .intercept(Context::background(), Bytes::new(), info(), Next::new(handler))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }
}
