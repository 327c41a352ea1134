use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dispatch_bus::module::audit::{AuditOutcome, AuditRecord, AuditSink};
use dispatch_bus::module::retry::RetryOptions;
use dispatch_bus::module::{
    ConfiguredModule, MockModuleSettingsSource, Module, ModuleFactory,
};
use dispatch_bus::{
    AnyResponse, Bus, BusConfig, BusError, BusResult, ConfigurationError, ExecutionContext,
    ModuleIdentifier, ModuleOptions, ModuleProvider, ModuleSettings, Next, PipelineContext,
    RequestHandler, ServiceCollection, ServiceProvider, DEFAULT_PROFILE,
};
use pretty_assertions::assert_eq;

use super::{appender, Trace};

/// Module whose provider appends its configured `value` to the response.
#[derive(Debug, Clone)]
struct StampOptions {
    value: String,
}

impl Default for StampOptions {
    fn default() -> Self {
        Self {
            value: "V0".to_string(),
        }
    }
}

impl ModuleOptions for StampOptions {
    fn overlay(&mut self, module: &str, settings: &ModuleSettings) -> BusResult<()> {
        if let Some(value) = settings.read(module, "value")? {
            self.value = value;
        }
        Ok(())
    }
}

struct StampProvider;

#[async_trait]
impl ModuleProvider<StampOptions> for StampProvider {
    async fn execute(
        &self,
        _id: &ModuleIdentifier,
        options: &StampOptions,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> BusResult<AnyResponse> {
        let inner = next.run_typed::<String>(ctx).await?;
        Ok(Box::new(format!("{}:{}", inner, options.value)))
    }
}

fn stamp_factory() -> ModuleFactory {
    Arc::new(|_: &dyn ServiceProvider| -> BusResult<Arc<dyn Module>> {
        Ok(Arc::new(ConfiguredModule::new(
            "Stamp",
            10,
            StampOptions::default(),
            StampProvider,
        )))
    })
}

fn stamp_profiles() -> HashMap<String, ModuleSettings> {
    HashMap::from([
        (
            DEFAULT_PROFILE.to_string(),
            ModuleSettings::new().with("value", "V1"),
        ),
        ("Gold".to_string(), ModuleSettings::new().with("value", "V2")),
    ])
}

async fn stamped(source: MockModuleSettingsSource, profile: Option<&str>) -> BusResult<String> {
    let bus = Bus::builder().settings_source(source).build();
    bus.register_module("Stamp", stamp_factory())?;
    let key = bus.register_handler("", appender("H"))?;
    bus.attach_module(&key, "Stamp", profile, None)?;
    bus.complete_registration();
    bus.send(Trace("X".into())).await
}

#[tokio::test]
async fn test_builtin_defaults_without_profiles() -> BusResult<()> {
    let mut source = MockModuleSettingsSource::new();
    source.expect_profiles().returning(|_| HashMap::new());
    source.expect_override_for().returning(|_| None);

    assert_eq!(stamped(source, None).await?, "X:H:V0");
    Ok(())
}

#[tokio::test]
async fn test_default_profile_over_builtin() -> BusResult<()> {
    let mut source = MockModuleSettingsSource::new();
    source
        .expect_profiles()
        .returning(|module| if module == "Stamp" { stamp_profiles() } else { HashMap::new() });
    source.expect_override_for().returning(|_| None);

    assert_eq!(stamped(source, None).await?, "X:H:V1");
    Ok(())
}

#[tokio::test]
async fn test_requested_profile_over_default() -> BusResult<()> {
    let mut source = MockModuleSettingsSource::new();
    source.expect_profiles().returning(|_| stamp_profiles());
    source.expect_override_for().returning(|_| None);

    assert_eq!(stamped(source, Some("Gold")).await?, "X:H:V2");
    Ok(())
}

#[tokio::test]
async fn test_missing_profile_falls_back_to_default() -> BusResult<()> {
    let mut source = MockModuleSettingsSource::new();
    source.expect_profiles().returning(|_| stamp_profiles());
    source.expect_override_for().returning(|_| None);

    assert_eq!(stamped(source, Some("Platinum")).await?, "X:H:V1");
    Ok(())
}

#[tokio::test]
async fn test_override_over_profile() -> BusResult<()> {
    let mut source = MockModuleSettingsSource::new();
    source.expect_profiles().returning(|_| stamp_profiles());
    source
        .expect_override_for()
        .returning(|id| (id.profile == "Gold").then(|| ModuleSettings::new().with("value", "V3")));

    assert_eq!(stamped(source, Some("Gold")).await?, "X:H:V3");
    Ok(())
}

#[tokio::test]
async fn test_attach_override_beats_source() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_module("Stamp", stamp_factory())?;
    let key = bus.register_handler("", appender("H"))?;
    let id = bus.attach_module(
        &key,
        "Stamp",
        None,
        Some(ModuleSettings::new().with("value", "inline")),
    )?;
    bus.complete_registration();

    assert_eq!(id.profile, DEFAULT_PROFILE);
    assert_eq!(bus.send(Trace("X".into())).await?, "X:H:inline");
    Ok(())
}

/// Fails with a retryable error until `succeed_on` attempts were made.
struct Flaky {
    calls: Arc<AtomicUsize>,
    succeed_on: usize,
}

#[async_trait]
impl RequestHandler<Trace, String> for Flaky {
    async fn handle(&self, request: &Trace, _ctx: &dyn ExecutionContext) -> BusResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            return Err(BusError::handler(format!("transient failure #{}", call)));
        }
        Ok(format!("{}:ok@{}", request.0, call))
    }
}

#[tokio::test]
async fn test_retry_until_success() -> BusResult<()> {
    let config = BusConfig::default().with_profile(
        "Retry",
        "Fast",
        ModuleSettings::new().with("max_attempts", 4).with("delay_ms", 1),
    );
    let bus = Bus::builder().config(config).build();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = bus.register_handler(
        "",
        Flaky {
            calls: Arc::clone(&calls),
            succeed_on: 3,
        },
    )?;
    bus.attach_module(&key, "Retry", Some("Fast"), None)?;
    bus.complete_registration();

    assert_eq!(bus.send(Trace("X".into())).await?, "X:ok@3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() -> BusResult<()> {
    let bus = Bus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = bus.register_handler(
        "",
        Flaky {
            calls: Arc::clone(&calls),
            succeed_on: usize::MAX,
        },
    )?;
    bus.attach_module(
        &key,
        "Retry",
        None,
        Some(ModuleSettings::new().with("max_attempts", 2).with("delay_ms", 0)),
    )?;
    bus.complete_registration();

    let error = bus.send(Trace("X".into())).await.unwrap_err();
    assert_eq!(error.to_string(), "Handler error: transient failure #2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

struct PassThrough;

#[async_trait]
impl ModuleProvider<RetryOptions> for PassThrough {
    async fn execute(
        &self,
        _id: &ModuleIdentifier,
        _options: &RetryOptions,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> BusResult<AnyResponse> {
        next.run(ctx).await
    }
}

#[tokio::test]
async fn test_registered_provider_replaces_builtin() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_module_provider::<RetryOptions, _>("Retry", PassThrough)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let key = bus.register_handler(
        "",
        Flaky {
            calls: Arc::clone(&calls),
            succeed_on: 2,
        },
    )?;
    bus.attach_module(&key, "Retry", None, None)?;
    bus.complete_registration();

    assert!(bus.send(Trace("X".into())).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let error = bus
        .register_module_provider::<RetryOptions, _>("Retry", PassThrough)
        .unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::DuplicateProvider(_))
    ));
    Ok(())
}

struct Sleepy(Duration);

#[async_trait]
impl RequestHandler<Trace, String> for Sleepy {
    async fn handle(&self, request: &Trace, _ctx: &dyn ExecutionContext) -> BusResult<String> {
        tokio::time::sleep(self.0).await;
        Ok(request.0.clone())
    }
}

#[tokio::test]
async fn test_timeout_module() -> BusResult<()> {
    let bus = Bus::new();
    let slow = bus.register_handler("slow", Sleepy(Duration::from_millis(500)))?;
    let quick = bus.register_handler("quick", Sleepy(Duration::from_millis(1)))?;
    let overrides = ModuleSettings::new().with("timeout_ms", 50);
    bus.attach_module(&slow, "Timeout", None, Some(overrides.clone()))?;
    bus.attach_module(&quick, "Timeout", None, Some(overrides))?;
    bus.complete_registration();

    let error = bus.send_named(Trace("X".into()), "slow").await.unwrap_err();
    assert!(matches!(error, BusError::Timeout { .. }));
    assert_eq!(bus.send_named(Trace("Y".into()), "quick").await?, "Y");
    Ok(())
}

#[derive(Default)]
struct CollectingSink(Mutex<Vec<AuditRecord>>);

#[async_trait]
impl AuditSink for CollectingSink {
    async fn record(&self, record: AuditRecord) {
        self.0.lock().unwrap().push(record);
    }
}

#[tokio::test]
async fn test_audit_wraps_retry() -> BusResult<()> {
    let sink = Arc::new(CollectingSink::default());
    let services = ServiceCollection::new();
    services.add::<Arc<dyn AuditSink>>(sink.clone());

    let config = BusConfig::default().with_profile(
        "Audit",
        DEFAULT_PROFILE,
        ModuleSettings::new().with("label", "payments"),
    );
    let bus = Bus::builder().config(config).services(services).build();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = bus.register_handler(
        "",
        Flaky {
            calls: Arc::clone(&calls),
            succeed_on: 2,
        },
    )?;
    // Attachment order does not matter; Audit has the lowest priority.
    bus.attach_module(
        &key,
        "Retry",
        None,
        Some(ModuleSettings::new().with("delay_ms", 1)),
    )?;
    bus.attach_module(&key, "Audit", None, None)?;
    bus.complete_registration();

    assert_eq!(bus.send(Trace("X".into())).await?, "X:ok@2");

    let records = sink.0.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Succeeded);
    assert_eq!(records[0].label.as_deref(), Some("payments"));
    assert_eq!(records[0].handle, "Trace -> String");
    Ok(())
}

#[tokio::test]
async fn test_module_registration_faults() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_module("Stamp", stamp_factory())?;
    let error = bus.register_module("Stamp", stamp_factory()).unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::DuplicateModule(_))
    ));

    let key = bus.register_handler("", appender("H"))?;
    let error = bus.attach_module(&key, "Compression", None, None).unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::ModuleNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_conflicting_overrides_for_shared_pair_are_rejected() -> BusResult<()> {
    let bus = Bus::new();
    let lenient = bus.register_handler("lenient", Sleepy(Duration::from_millis(50)))?;
    let strict = bus.register_handler("strict", Sleepy(Duration::from_millis(50)))?;
    let twin = bus.register_handler("twin", Sleepy(Duration::from_millis(1)))?;
    let generous = ModuleSettings::new().with("timeout_ms", 10_000);

    bus.attach_module(&lenient, "Timeout", None, Some(generous.clone()))?;
    let error = bus
        .attach_module(
            &strict,
            "Timeout",
            None,
            Some(ModuleSettings::new().with("timeout_ms", 1)),
        )
        .unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::ConflictingOverride(_))
    ));
    assert!(error.is_fatal());

    let error = bus.attach_module(&strict, "Timeout", None, None).unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::ConflictingOverride(_))
    ));

    // A matching override shares the existing wrapper.
    bus.attach_module(&twin, "Timeout", None, Some(generous))?;
    bus.complete_registration();

    assert_eq!(bus.send_named(Trace("X".into()), "lenient").await?, "X");
    assert_eq!(bus.send_named(Trace("Y".into()), "twin").await?, "Y");
    Ok(())
}

struct Marker;

#[async_trait]
impl ModuleProvider<RetryOptions> for Marker {
    async fn execute(
        &self,
        _id: &ModuleIdentifier,
        _options: &RetryOptions,
        ctx: &mut PipelineContext,
        next: Next<'_>,
    ) -> BusResult<AnyResponse> {
        let inner = next.run_typed::<String>(ctx).await?;
        Ok(Box::new(format!("{}:custom", inner)))
    }
}

#[tokio::test]
async fn test_provider_after_attach_is_rejected() -> BusResult<()> {
    let bus = Bus::new();
    let key = bus.register_handler("", appender("H"))?;
    bus.attach_module(&key, "Retry", None, None)?;

    let error = bus
        .register_module_provider::<RetryOptions, _>("Retry", Marker)
        .unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::ProviderAfterAttach(_))
    ));
    bus.complete_registration();

    assert_eq!(bus.send(Trace("X".into())).await?, "X:H");
    Ok(())
}

#[tokio::test]
async fn test_provider_before_attach_runs() -> BusResult<()> {
    let bus = Bus::new();
    bus.register_module_provider::<RetryOptions, _>("Retry", Marker)?;
    let key = bus.register_handler("", appender("H"))?;
    bus.attach_module(&key, "Retry", None, None)?;
    bus.complete_registration();

    assert_eq!(bus.send(Trace("X".into())).await?, "X:H:custom");
    Ok(())
}

#[tokio::test]
async fn test_attach_after_seal_leaves_no_state() -> BusResult<()> {
    let bus = Bus::new();
    let key = bus.register_handler("", appender("H"))?;
    bus.complete_registration();

    let error = bus
        .attach_module(
            &key,
            "Retry",
            None,
            Some(ModuleSettings::new().with("max_attempts", 9)),
        )
        .unwrap_err();
    assert!(matches!(
        error,
        BusError::Configuration(ConfigurationError::RegistrySealed { .. })
    ));

    // The module was never instantiated, so a provider can still be registered.
    bus.register_module_provider::<RetryOptions, _>("Retry", Marker)?;
    assert_eq!(bus.send(Trace("X".into())).await?, "X:H");
    Ok(())
}
