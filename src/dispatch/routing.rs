//! Dispatch-decision label routing.
//!
//! A job's label set determines whether it runs ephemeral or against a
//! named container: the first label that is neither the registration's own
//! advertised label set nor a reserved forge label is read as a container
//! name. The reserved-label set is configuration rather than a hard-coded
//! list — see [`crate::config::DaemonConfiguration::reserved_labels`].

/// Selects a container name from a job's labels, or `None` for the
/// ephemeral path. Comparisons are case-insensitive since labels are
/// forge-supplied free text.
pub fn select_container_name(
    job_labels: &[String],
    registration_labels: &[&str],
    reserved_labels: &[String],
) -> Option<String> {
    job_labels.iter().find_map(|label| {
        let lower = label.to_lowercase();
        let is_registration_label = registration_labels.iter().any(|r| r.to_lowercase() == lower);
        let is_reserved = reserved_labels.iter().any(|r| r.to_lowercase() == lower);
        if is_registration_label || is_reserved {
            None
        } else {
            Some(label.clone())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved() -> Vec<String> {
        crate::config::default_reserved_labels()
    }

    #[test]
    fn only_distinguishing_label_is_ephemeral() {
        let name = select_container_name(
            &["devcontainer-runner".to_string()],
            &["devcontainer-runner"],
            &reserved(),
        );
        assert_eq!(name, None);
    }

    #[test]
    fn reserved_labels_never_become_a_name() {
        let name = select_container_name(
            &["devcontainer-runner".to_string(), "self-hosted".to_string(), "Linux".to_string()],
            &["devcontainer-runner"],
            &reserved(),
        );
        assert_eq!(name, None);
    }

    #[test]
    fn extra_label_becomes_container_name() {
        let name = select_container_name(
            &["devcontainer-runner".to_string(), "svc-dev".to_string()],
            &["devcontainer-runner"],
            &reserved(),
        );
        assert_eq!(name, Some("svc-dev".to_string()));
    }

    #[test]
    fn first_extra_label_wins() {
        let name = select_container_name(
            &["svc-dev".to_string(), "svc-other".to_string()],
            &["devcontainer-runner"],
            &reserved(),
        );
        assert_eq!(name, Some("svc-dev".to_string()));
    }
}
