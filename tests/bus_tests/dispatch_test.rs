use async_trait::async_trait;
use dispatch_bus::{
    handler_fn, Bus, BusError, BusResult, ConfigurationError, DynamicRequest, ExecutionContext,
    HandleKey, PipelineContext, Request, RequestHandler, SendOptions, ServiceCollection,
    ServiceProviderExt,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::{appender, Append, Trace};

#[tokio::test]
async fn test_last_registration_is_type_default() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_handler("", appender("A"))?;
    bus.register_handler("fast", appender("B"))?;
    bus.complete_registration();

    assert_eq!(bus.send(Trace("X".into())).await?, "X:B");
    assert_eq!(bus.send_named(Trace("X".into()), "fast").await?, "X:B");
    Ok(())
}

#[tokio::test]
async fn test_named_lookup_ignores_registration_order() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_handler("b", appender("B"))?;
    bus.register_handler("a", appender("A"))?;
    bus.register_handler("", appender("D"))?;
    bus.complete_registration();

    assert_eq!(bus.send_named(Trace("X".into()), "a").await?, "X:A");
    assert_eq!(bus.send_named(Trace("X".into()), "b").await?, "X:B");
    assert_eq!(bus.send(Trace("X".into())).await?, "X:D");

    let error = bus.send_named(Trace("X".into()), "c").await.unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::HandlerNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_response_type_selects_handler() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_handler("", appender("text"))?;
    bus.register_handler(
        "",
        handler_fn(|req: &Trace, _ctx: &dyn ExecutionContext| Ok(req.0.len())),
    )?;
    bus.complete_registration();

    let text: String = bus.send(Trace("abc".into())).await?;
    let length: usize = bus
        .send_as::<Trace, usize>(Trace("abc".into()), SendOptions::default())
        .await?;
    assert_eq!(text, "abc:text");
    assert_eq!(length, 3);

    let error = bus
        .send_object(DynamicRequest::new(Trace("abc".into())), "")
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::AmbiguousHandler { candidates: 2, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_pipeline_order() -> BusResult<()> {
    let bus = Bus::new();
    let key = bus.register_handler("", appender("H"))?;
    bus.register_pipeline(&key, 2, Append("P2"))?;
    bus.register_pipeline(&key, 1, Append("P1"))?;
    bus.complete_registration();

    assert_eq!(bus.send(Trace("X".into())).await?, "X:H:P2:P1");
    // The composed chain is cached; a second dispatch sees the same order.
    assert_eq!(bus.send(Trace("Y".into())).await?, "Y:H:P2:P1");
    Ok(())
}

#[tokio::test]
async fn test_pipeline_for_unknown_handler_is_ignored() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_handler("", appender("H"))?;
    bus.register_pipeline(&HandleKey::of::<Trace, String>("missing"), 1, Append("P"))?;
    bus.complete_registration();

    assert_eq!(bus.send(Trace("X".into())).await?, "X:H");
    Ok(())
}

struct TagFirst;

#[async_trait]
impl dispatch_bus::PipelineBehavior for TagFirst {
    async fn handle(
        &self,
        ctx: &mut PipelineContext,
        next: dispatch_bus::Next<'_>,
    ) -> BusResult<dispatch_bus::AnyResponse> {
        if ctx.request::<Trace>().map(|t| t.0.as_str()) == Some("first") {
            ctx.items_mut().insert("user", "alice".to_string());
        }
        next.run(ctx).await
    }
}

#[tokio::test]
async fn test_items_reach_handler_and_do_not_leak() -> BusResult<()> {
    let bus = Bus::new();
    let key = bus.register_handler(
        "",
        handler_fn(|_req: &Trace, ctx: &dyn ExecutionContext| {
            let user = ctx
                .items()
                .and_then(|items| items.get::<String>("user").cloned())
                .unwrap_or_else(|| "none".to_string());
            Ok(user)
        }),
    )?;
    bus.register_pipeline(&key, 0, TagFirst)?;
    bus.complete_registration();

    assert_eq!(bus.send(Trace("first".into())).await?, "alice");
    assert_eq!(bus.send(Trace("second".into())).await?, "none");
    assert_eq!(bus.pool_stats().pipeline.created, 1);
    Ok(())
}

#[tokio::test]
async fn test_sealing_is_one_way() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_handler("", appender("H"))?;

    let error = bus.send(Trace("X".into())).await.unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::RegistryNotSealed { .. })
    ));

    bus.complete_registration();
    bus.complete_registration();
    assert!(bus.is_sealed());
    assert_eq!(bus.send(Trace("X".into())).await?, "X:H");

    let error = bus.register_handler("late", appender("L")).unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::RegistrySealed { .. })
    ));
    assert!(error.is_fatal());
    Ok(())
}

struct Shutdown;

#[tokio::test]
async fn test_dynamic_sends() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_handler("", appender("H"))?;
    bus.register_handler(
        "",
        handler_fn(|_req: &Shutdown, _ctx: &dyn ExecutionContext| Ok(())),
    )?;
    bus.complete_registration();

    let text: String = bus
        .send_dynamic(DynamicRequest::new(Trace("X".into())), "")
        .await?;
    assert_eq!(text, "X:H");

    let object = bus
        .send_object(DynamicRequest::new(Trace("Y".into())), "")
        .await?;
    assert_eq!(object.downcast_ref::<String>().map(String::as_str), Some("Y:H"));

    bus.send_void(DynamicRequest::new(Shutdown), "").await?;

    let error = bus
        .send_void(DynamicRequest::new(Trace("Z".into())), "")
        .await
        .unwrap_err();
    assert!(error.is_fatal());
    Ok(())
}

#[derive(Debug, thiserror::Error)]
#[error("insufficient funds: {0}")]
struct InsufficientFunds(u32);

#[tokio::test]
async fn test_handler_error_propagates_unchanged() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_handler(
        "",
        handler_fn(|_req: &Trace, _ctx: &dyn ExecutionContext| -> BusResult<String> {
            Err(BusError::handler(InsufficientFunds(42)))
        }),
    )?;
    bus.complete_registration();

    let error = bus.send(Trace("X".into())).await.unwrap_err();
    assert!(!error.is_fatal());
    assert_eq!(
        error.downcast_handler_ref::<InsufficientFunds>().map(|e| e.0),
        Some(42)
    );
    Ok(())
}

#[tokio::test]
async fn test_cancelled_token_stops_dispatch() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_handler("", appender("H"))?;
    bus.complete_registration();

    let token = CancellationToken::new();
    token.cancel();
    let error = bus
        .send_as::<Trace, String>(
            Trace("X".into()),
            SendOptions::default().with_cancellation(token),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, BusError::Cancelled));
    Ok(())
}

struct Greeting(&'static str);

struct Greet;

impl Request for Greet {
    type Response = String;
}

struct Outer;

impl Request for Outer {
    type Response = String;
}

struct OuterHandler;

#[async_trait]
impl RequestHandler<Outer, String> for OuterHandler {
    async fn handle(&self, _request: &Outer, ctx: &dyn ExecutionContext) -> BusResult<String> {
        let bus = ctx
            .bus()
            .ok_or_else(|| BusError::internal("dispatched without a bus"))?;
        let inner = bus.send(Greet).await?;
        Ok(format!("outer({})", inner))
    }
}

#[tokio::test]
async fn test_handlers_use_services_and_nested_dispatch() -> BusResult<()> {
    let services = ServiceCollection::new();
    services.add(Greeting("hello"));
    let bus = Bus::builder().services(services).build();

    bus.register_handler(
        "",
        handler_fn(|_req: &Greet, ctx: &dyn ExecutionContext| {
            let greeting = ctx.services().require::<Greeting>()?;
            Ok(greeting.0.to_string())
        }),
    )?;
    bus.register_handler("", OuterHandler)?;
    bus.complete_registration();

    assert_eq!(bus.send(Outer).await?, "outer(hello)");
    assert_eq!(bus.send(Outer).await?, "outer(hello)");

    // The nested dispatch found the per-thread slot taken and rented from
    // the pool instead; both contexts are reused afterwards.
    let stats = bus.pool_stats().handler;
    assert!(stats.created <= 2);
    Ok(())
}

#[tokio::test]
async fn test_builder_loads_config_file_and_shared_services() -> BusResult<()> {
    use std::io::Write;
    use std::sync::Arc;

    use dispatch_bus::{PublishStrategy, ServiceProvider};

    let mut file = tempfile::NamedTempFile::new().map_err(|e| BusError::internal(e.to_string()))?;
    write!(
        file,
        r#"{{ "fast_path": false, "publish_strategy": "Parallel", "modules": {{ "Retry": {{ "Default": {{ "max_attempts": 1 }} }} }} }}"#
    )
    .map_err(|e| BusError::internal(e.to_string()))?;

    let services = ServiceCollection::new();
    services.add(Greeting("shared"));
    let shared: Arc<dyn ServiceProvider> = Arc::new(services);

    let bus = Bus::builder()
        .config_file(file.path())?
        .shared_services(Arc::clone(&shared))
        .build();
    assert!(!bus.config().fast_path);
    assert_eq!(bus.config().publish_strategy, PublishStrategy::Parallel);
    assert!(Arc::ptr_eq(bus.services(), &shared));

    bus.register_handler(
        "",
        handler_fn(|_req: &Greet, ctx: &dyn ExecutionContext| {
            Ok(ctx.services().require::<Greeting>()?.0.to_string())
        }),
    )?;
    bus.complete_registration();
    assert_eq!(bus.send(Greet).await?, "shared");
    assert_eq!(bus.pool_stats().handler.retained, 1);

    let Err(error) = Bus::builder().config_file(file.path().with_extension("missing")) else {
        panic!("loading a missing config file should fail");
    };
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::Load(_))
    ));
    Ok(())
}
