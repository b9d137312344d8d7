use anyhow::{Result, anyhow};

/// Collapse the errors collected along a cleanup path into a single error.
/// Cleanup steps never abort each other, so callers gather everything and
/// combine at the end.
pub(crate) fn combine(errs: Vec<anyhow::Error>) -> Result<()> {
    let mut errs = errs;
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.remove(0)),
        _ => {
            let mut msg = String::from("multiple cleanup errors occurred:");
            for err in &errs {
                msg.push_str("\n  - ");
                msg.push_str(&format!("{err:#}"));
            }
            Err(anyhow!(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::combine;
    use anyhow::anyhow;

    #[test]
    fn empty_list_is_ok() {
        assert!(combine(Vec::new()).is_ok());
    }

    #[test]
    fn single_error_passes_through() {
        let err = combine(vec![anyhow!("boom")]).unwrap_err();
        assert_eq!(format!("{err}"), "boom");
    }

    #[test]
    fn multiple_errors_are_listed() {
        let err = combine(vec![anyhow!("first"), anyhow!("second")]).unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("multiple cleanup errors occurred"));
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }
}
