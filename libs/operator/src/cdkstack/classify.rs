/// Maps `cdk deploy`/`cdk destroy` output to an operator-friendly summary by substring match,
/// per the classification table in the deploy state machine's failure path.
pub fn classify_cdk_failure(output: &str, exit_code: i32) -> String {
    if output.contains("no credentials have been configured") {
        "Credentials secret missing/invalid".to_owned()
    } else if output.contains("Unable to resolve AWS account") {
        "Account/caller identity resolution failed".to_owned()
    } else if output.contains("AccessDenied") {
        "Permissions insufficient".to_owned()
    } else if output.contains("ValidationError") {
        "Template validation failure".to_owned()
    } else if output.contains("npm ERR") || output.contains("dependency") {
        "Dependency install failure".to_owned()
    } else if output.contains("Region") {
        "Region misconfiguration".to_owned()
    } else {
        format!("cdk command failed with exit code {exit_code}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_credentials() {
        assert_eq!(
            classify_cdk_failure("Error: no credentials have been configured", 1),
            "Credentials secret missing/invalid"
        );
    }

    #[test]
    fn unresolved_account() {
        assert_eq!(
            classify_cdk_failure("Unable to resolve AWS account to use", 1),
            "Account/caller identity resolution failed"
        );
    }

    #[test]
    fn access_denied() {
        assert_eq!(
            classify_cdk_failure("User is not authorized: AccessDenied", 1),
            "Permissions insufficient"
        );
    }

    #[test]
    fn validation_error() {
        assert_eq!(
            classify_cdk_failure("ValidationError: template is invalid", 1),
            "Template validation failure"
        );
    }

    #[test]
    fn dependency_failure() {
        assert_eq!(
            classify_cdk_failure("npm ERR! code ENOENT", 1),
            "Dependency install failure"
        );
    }

    #[test]
    fn region_misconfiguration() {
        assert_eq!(
            classify_cdk_failure("Region is not set correctly", 1),
            "Region misconfiguration"
        );
    }

    #[test]
    fn generic_fallback_includes_exit_code() {
        assert_eq!(
            classify_cdk_failure("something unexpected happened", 2),
            "cdk command failed with exit code 2"
        );
    }
}
