use pretty_assertions::assert_eq;
use x86pm::cpu::{ConfigError, CpuClass, CpuMode};
use x86pm::{CpuConfig, CpuContext};

#[test]
fn empty_document_yields_defaults() -> anyhow::Result<()> {
    let config: CpuConfig = serde_json::from_str("{}")?;
    assert_eq!(config, CpuConfig::default());
    assert_eq!(config.class, CpuClass::Pentium);
    assert!(config.set_accessed_bits);
    Ok(())
}

#[test]
fn partial_document_overrides_named_fields() -> anyhow::Result<()> {
    let config: CpuConfig = serde_json::from_str(
        r#"{ "class": "i386", "tlb_capacity": 64, "reset_vector_high": false }"#,
    )?;
    assert_eq!(config.class, CpuClass::I386);
    assert_eq!(config.tlb_capacity, 64);
    assert!(!config.reset_vector_high);
    assert_eq!(config.pse36, CpuConfig::default().pse36);

    let cpu = CpuContext::with_config(config)?;
    assert_eq!(cpu.mode(), CpuMode::Real);
    assert_eq!(cpu.eip, 0);
    assert_eq!(cpu.mmu.config().tlb_capacity, 64);
    Ok(())
}

#[test]
fn out_of_range_capacity_is_rejected() -> anyhow::Result<()> {
    let config: CpuConfig = serde_json::from_str(r#"{ "tlb_capacity": 3 }"#)?;
    assert_eq!(config.validate(), Err(ConfigError::TlbCapacity(3)));
    assert!(matches!(
        CpuContext::with_config(config),
        Err(ConfigError::TlbCapacity(3))
    ));
    Ok(())
}

#[test]
fn unknown_class_fails_to_parse() {
    assert!(serde_json::from_str::<CpuConfig>(r#"{ "class": "z80" }"#).is_err());
}
