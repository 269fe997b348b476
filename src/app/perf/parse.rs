use std::sync::OnceLock;

use regex::Regex;

pub const CPU_TOTAL_COMMAND: &str = "dumpsys cpuinfo | grep TOTAL";
pub const USED_RAM_COMMAND: &str = "dumpsys meminfo | grep Used";
pub const DEVICE_TIME_COMMAND: &str = "date +%s%3N";

pub fn package_pss_command(package: &str) -> String {
    format!("dumpsys meminfo {package} | grep TOTAL")
}

pub fn package_meminfo_command(package: &str) -> String {
    format!("dumpsys meminfo {package}")
}

fn cpu_total_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)%\s*TOTAL").expect("valid cpu regex"))
}

fn used_ram_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Used RAM:\s*([\d,]+)").expect("valid used ram regex"))
}

fn total_pss_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"TOTAL(?: PSS)?:?\s+(\d+)").expect("valid pss regex"))
}

/// Total CPU load from `dumpsys cpuinfo`. Some devices print a stray minus inside the figure
/// (`30.-6%`); it is dropped before matching.
pub fn parse_cpu_usage(output: &str) -> Result<String, String> {
    let cleaned = output.replace('-', "");
    cpu_total_regex()
        .captures(&cleaned)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| format!("Missing TOTAL line in cpuinfo: {}", output.trim()))
}

/// Used RAM in kB from `dumpsys meminfo`; thousands separators are removed.
pub fn parse_used_ram(output: &str) -> Result<String, String> {
    used_ram_regex()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace(',', ""))
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("Missing Used RAM line in meminfo: {}", output.trim()))
}

/// Total PSS of a package, or `None` when the package has no running process.
pub fn parse_package_pss(output: &str) -> Option<String> {
    total_pss_regex()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPU_LINE: &str =
        "% TOTAL: 21% user + 6.7% kernel + 1.2% iowait + 0.7% irq + 0.5% softirq";

    #[test]
    fn parse_cpu_usage_reads_integer_total() {
        assert_eq!(parse_cpu_usage(&format!("30{CPU_LINE}")).unwrap(), "30");
    }

    #[test]
    fn parse_cpu_usage_drops_stray_minus() {
        assert_eq!(parse_cpu_usage(&format!("30.-6{CPU_LINE}")).unwrap(), "30.6");
    }

    #[test]
    fn parse_cpu_usage_rejects_missing_total() {
        assert!(parse_cpu_usage("").is_err());
    }

    #[test]
    fn parse_used_ram_reads_kilobytes() {
        let output = "Used RAM: 1016104 kB (819528 used pss + 196576 kernel)";
        assert_eq!(parse_used_ram(output).unwrap(), "1016104");
    }

    #[test]
    fn parse_used_ram_strips_separators() {
        let output = " Used RAM: 1,016,104K (819,528K used pss + 196,576K kernel)";
        assert_eq!(parse_used_ram(output).unwrap(), "1016104");
    }

    #[test]
    fn parse_package_pss_reads_first_total() {
        let output = " TOTAL    20411     7516    10228      980    36740    28499     8240   \
                      TOTAL:    20411      TOTAL SWAP (KB):      980";
        assert_eq!(parse_package_pss(output).as_deref(), Some("20411"));
    }

    #[test]
    fn parse_package_pss_reads_newer_layout() {
        assert_eq!(
            parse_package_pss("  TOTAL PSS:    20411            TOTAL RSS:    88000").as_deref(),
            Some("20411")
        );
    }

    #[test]
    fn parse_package_pss_none_without_process() {
        assert_eq!(parse_package_pss("No process found for: fake.app"), None);
    }

    #[test]
    fn package_commands_name_the_package() {
        assert_eq!(
            package_pss_command("com.google.android.calendar"),
            "dumpsys meminfo com.google.android.calendar | grep TOTAL"
        );
        assert_eq!(package_meminfo_command("fake.app"), "dumpsys meminfo fake.app");
    }
}
