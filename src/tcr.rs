//! Temporary capacity record decoding.
//!
//! A record arrives as a pseudo-XML report (see [`crate::dsm`]) rooted at
//! `report/record`. Only decoding and lookups live here.

use crate::dsm::{self, Node};
use crate::error::{Error, Result};

const PLACEHOLDER_DATE: &str = "----/--/-- --:--:--";

/// Per processor type limits of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorInfo {
    /// Processor type, e.g. `CP` or `IFL`.
    pub kind: String,
    /// Processor step (0 when absent).
    pub proc_step: i64,
    /// Speed step (0 when absent).
    pub speed_step: i64,
    /// Maximum number of processors.
    pub max: i64,
    /// Remaining processor days.
    pub remaining_proc_days: i64,
    /// Remaining MSU days (-1 when absent).
    pub remaining_msu_days: i64,
}

/// A capacity target the record can be activated to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Processor step.
    pub proc_step: i64,
    /// Speed step.
    pub speed_step: i64,
    /// Software model identifier.
    pub software_model: String,
    /// Billable MSU cost.
    pub msu_cost: i64,
    /// Billable MSU delta.
    pub msu_delta: i64,
}

/// Remaining budget of one activation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mode {
    /// Activations left.
    pub remaining_activations: i64,
    /// Days left.
    pub remaining_days: i64,
}

/// A decoded temporary capacity record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityRecord {
    /// Record identifier.
    pub id: String,
    /// Record type, e.g. `CBU` or `PLANNED_EVENT`.
    pub kind: String,
    /// `Real`, `Test` or `Installed`.
    pub status: String,
    /// Expiration as `YYYY/MM/DD hh:mm:ss`.
    pub expiration: String,
    /// Last activation, only for active records.
    pub last_activation: Option<String>,
    /// Real mode budget.
    pub real: Mode,
    /// Test mode budget.
    pub test: Mode,
    /// Processor limits.
    pub cpus: Vec<ProcessorInfo>,
    /// Activation targets.
    pub targets: Vec<Target>,
}

impl CapacityRecord {
    /// Decode a record report.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let root = dsm::parse(xml)?;
        Self::from_tree(&root)
    }

    /// Decode an already parsed report.
    pub fn from_tree(root: &Node) -> Result<Self> {
        let id = root.get_string("report/record/recordid")?.to_owned();
        let kind = root.get_string("report/record/recordtype")?.to_owned();
        let status = match root.get_string("report/record/status")? {
            s if s.eq_ignore_ascii_case("none") || s.eq_ignore_ascii_case("Available") => {
                "Installed".to_owned()
            }
            s => s.to_owned(),
        };
        let real_activations = root.get_int("report/record/remainingrealactivations")?;
        let test_activations = root.get_int("report/record/remainingtestactivations")?;
        let expiration = convert_date(root.get_string("report/record/recordexpiration")?)?;

        let last_activation = if is_active_status(&status) {
            Some(convert_date(
                root.get_string("report/record/activationstart")?,
            )?)
        } else {
            None
        };

        let cpus = root
            .get_all("report/record/processorinfo")?
            .into_iter()
            .map(processor_info)
            .collect::<Result<Vec<_>>>()?;
        let targets = root
            .get_all("report/record/target")?
            .into_iter()
            .map(target)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            kind,
            status,
            expiration,
            last_activation,
            real: Mode {
                remaining_activations: real_activations,
                remaining_days: root.get_int("report/record/remainingrealdays")?,
            },
            test: Mode {
                remaining_activations: test_activations,
                remaining_days: root.get_int("report/record/remainingtestdays")?,
            },
            cpus,
            targets,
        })
    }

    /// Whether the record is activated in real or test mode.
    pub fn is_active(&self) -> bool {
        is_active_status(&self.status)
    }

    /// Target with exactly this software model.
    pub fn find_software_model(&self, model: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.software_model == model)
    }

    /// Processor information for a type (case-insensitive).
    pub fn find_cpu(&self, kind: &str) -> Option<&ProcessorInfo> {
        self.cpus.iter().find(|c| c.kind.eq_ignore_ascii_case(kind))
    }

    /// Processor step of a type, 0 if the record does not list it.
    pub fn active_quantity(&self, kind: &str) -> i64 {
        self.find_cpu(kind).map_or(0, |c| c.proc_step)
    }

    /// Software model of the target with no processor or speed steps.
    pub fn current_model(&self) -> Option<&str> {
        self.targets
            .iter()
            .find(|t| t.proc_step == 0 && t.speed_step == 0)
            .map(|t| t.software_model.as_str())
    }
}

fn is_active_status(status: &str) -> bool {
    status.eq_ignore_ascii_case("Real") || status.eq_ignore_ascii_case("Test")
}

fn processor_info(node: &Node) -> Result<ProcessorInfo> {
    Ok(ProcessorInfo {
        kind: node.get_string("processorinfo/type")?.to_owned(),
        proc_step: node.get_int("processorinfo/procstep").unwrap_or(0),
        speed_step: node.get_int("processorinfo/speedstep").unwrap_or(0),
        max: node.get_int("processorinfo/max")?,
        remaining_proc_days: node.get_int("processorinfo/remainingprocdays")?,
        remaining_msu_days: node.get_int("processorinfo/remainingmsudays").unwrap_or(-1),
    })
}

fn target(node: &Node) -> Result<Target> {
    Ok(Target {
        proc_step: node.get_int("target/procstep")?,
        speed_step: node.get_int("target/speedstep")?,
        software_model: node.get_string("target/softwaremodel")?.to_owned(),
        msu_cost: node.get_int("target/billablemsucost")?,
        msu_delta: node.get_int("target/billablemsudelta")?,
    })
}

/// `YYYYMMDDhhmmss...` to `YYYY/MM/DD hh:mm:ss`; shorter input yields a placeholder.
fn convert_date(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.len() < 14 {
        return Ok(PLACEHOLDER_DATE.to_owned());
    }
    let digits = raw
        .get(..14)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or(Error::Protocol("invalid capacity record timestamp"))?;
    Ok(format!(
        "{}/{}/{} {}:{}:{}",
        &digits[0..4],
        &digits[4..6],
        &digits[6..8],
        &digits[8..10],
        &digits[10..12],
        &digits[12..14]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = "<report><record>\
        <recordid>R1234</recordid>\
        <recordtype>CBU</recordtype>\
        <status>Real</status>\
        <remainingrealactivations>0</remainingrealactivations>\
        <remainingtestactivations>5</remainingtestactivations>\
        <recordexpiration>20261231235959000</recordexpiration>\
        <activationstart>20260101080000</activationstart>\
        <processorinfo><type>CP</type><procstep>2</procstep><max>8</max>\
            <remainingprocdays>10</remainingprocdays></processorinfo>\
        <processorinfo><type>IFL</type><max>4</max>\
            <remainingprocdays>7</remainingprocdays>\
            <remainingmsudays>3</remainingmsudays></processorinfo>\
        <target><procstep>0</procstep><speedstep>0</speedstep>\
            <softwaremodel>701</softwaremodel><billablemsucost>100</billablemsucost>\
            <billablemsudelta>0</billablemsudelta></target>\
        <target><procstep>1</procstep><speedstep>0</speedstep>\
            <softwaremodel>702</softwaremodel><billablemsucost>180</billablemsucost>\
            <billablemsudelta>80</billablemsudelta></target>\
        <remainingrealdays>90</remainingrealdays>\
        <remainingtestdays>10</remainingtestdays>\
        </record></report>";

    #[test]
    fn decodes_record() {
        let rec = CapacityRecord::from_xml(RECORD).expect("record");
        assert_eq!(rec.id, "R1234");
        assert!(rec.is_active());
        assert_eq!(rec.expiration, "2026/12/31 23:59:59");
        assert_eq!(rec.last_activation.as_deref(), Some("2026/01/01 08:00:00"));
        assert_eq!(rec.real.remaining_days, 90);
        assert_eq!(rec.test.remaining_activations, 5);

        let ifl = rec.find_cpu("ifl").expect("ifl");
        assert_eq!((ifl.proc_step, ifl.speed_step, ifl.remaining_msu_days), (0, 0, 3));
        assert_eq!(rec.find_cpu("CP").expect("cp").remaining_msu_days, -1);
        assert_eq!(rec.active_quantity("CP"), 2);
        assert_eq!(rec.active_quantity("zIIP"), 0);

        assert_eq!(rec.find_software_model("702").expect("702").msu_delta, 80);
        assert!(rec.find_software_model("703").is_none());
        assert_eq!(rec.current_model(), Some("701"));
    }

    #[test]
    fn available_means_installed_and_skips_activation_start() {
        let xml = RECORD
            .replace("<status>Real</status>", "<status>Available</status>")
            .replace("<activationstart>20260101080000</activationstart>", "");
        let rec = CapacityRecord::from_xml(&xml).expect("record");
        assert_eq!(rec.status, "Installed");
        assert!(rec.last_activation.is_none());
    }

    #[test]
    fn missing_required_field() {
        let xml = RECORD.replace("<recordid>R1234</recordid>", "");
        let err = CapacityRecord::from_xml(&xml).expect_err("no id");
        assert!(matches!(err, Error::Tree(dsm::TreeError::InvalidPath(_))));
    }

    #[test]
    fn dates() {
        assert_eq!(convert_date("2026").expect("short"), PLACEHOLDER_DATE);
        assert!(convert_date("2026AB01000000").is_err());
    }
}
