//! Severity threshold evaluation
//!
//! Severities order from most to least severe (`High` is the smallest), so a
//! finding passes the threshold when `finding.severity <= threshold`.

use crate::backends::{Cve, MonitorStatus, Severity};

/// Findings at least as severe as `threshold`
pub fn filter_findings(cves: &[Cve], threshold: Severity) -> Vec<Cve> {
    cves.iter()
        .filter(|cve| cve.severity <= threshold)
        .cloned()
        .collect()
}

/// `Error` if any finding passes the threshold, `Ok` otherwise
pub fn evaluate_status(cves: &[Cve], threshold: Severity) -> MonitorStatus {
    if cves.iter().any(|cve| cve.severity <= threshold) {
        MonitorStatus::Error
    } else {
        MonitorStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cve(name: &str, severity: Severity) -> Cve {
        Cve {
            fix: String::new(),
            package: "pkg".to_string(),
            severity,
            url: String::new(),
            vuln: name.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let cves = vec![
            cve("a", Severity::High),
            cve("b", Severity::Medium),
            cve("c", Severity::Low),
            cve("d", Severity::Negligible),
        ];

        let names: Vec<String> = filter_findings(&cves, Severity::Medium)
            .into_iter()
            .map(|c| c.vuln)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert_eq!(filter_findings(&cves, Severity::High).len(), 1);
        assert_eq!(filter_findings(&cves, Severity::Negligible).len(), 4);
    }

    #[test]
    fn test_status_evaluation() {
        assert_eq!(evaluate_status(&[], Severity::Negligible), MonitorStatus::Ok);
        assert_eq!(
            evaluate_status(&[cve("low", Severity::Low)], Severity::High),
            MonitorStatus::Ok
        );
        assert_eq!(
            evaluate_status(&[cve("low", Severity::Low)], Severity::Low),
            MonitorStatus::Error
        );
    }
}
