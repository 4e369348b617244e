use serde::Deserialize;

use crate::types::{SmartAttribute, SmartData};

/// Parser families for smartctl output. Once a device has parsed
/// successfully its type is sticky: a later flaky scan can't downgrade a
/// known-NVMe device to SATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserType {
    Sata,
    Nvme,
    Scsi,
    Emmc,
}

impl ParserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sata => "sata",
            Self::Nvme => "nvme",
            Self::Scsi => "scsi",
            Self::Emmc => "emmc",
        }
    }
}

// Subset of `smartctl -aj` we consume.
#[derive(Debug, Deserialize)]
pub struct SmartctlOutput {
    pub device: Option<DeviceInfo>,
    pub model_name: Option<String>,
    pub model_family: Option<String>,
    pub serial_number: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub user_capacity: Option<Capacity>,
    pub smart_status: Option<SmartStatus>,
    pub temperature: Option<Temperature>,
    pub ata_smart_attributes: Option<AtaAttributes>,
    pub nvme_smart_health_information_log: Option<NvmeHealthLog>,
    pub scsi_grown_defect_list: Option<i64>,
    pub power_on_time: Option<PowerOnTime>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceInfo {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Capacity {
    pub bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SmartStatus {
    pub passed: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct Temperature {
    pub current: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AtaAttributes {
    pub table: Option<Vec<AtaAttribute>>,
}

#[derive(Debug, Deserialize)]
pub struct AtaAttribute {
    pub id: Option<u32>,
    pub name: Option<String>,
    pub value: Option<i64>,
    pub worst: Option<i64>,
    pub thresh: Option<i64>,
    pub raw: Option<AtaRaw>,
}

#[derive(Debug, Deserialize)]
pub struct AtaRaw {
    pub value: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct NvmeHealthLog {
    pub critical_warning: Option<i64>,
    pub temperature: Option<i64>,
    pub available_spare: Option<i64>,
    pub percentage_used: Option<i64>,
    pub data_units_read: Option<i64>,
    pub data_units_written: Option<i64>,
    pub power_cycles: Option<i64>,
    pub power_on_hours: Option<i64>,
    pub unsafe_shutdowns: Option<i64>,
    pub media_errors: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PowerOnTime {
    pub hours: Option<i64>,
}

/// Model strings that mark a device as virtual; those are skipped entirely.
const VIRTUAL_MARKERS: &[&str] = &[
    "qemu", "virtual", "vbox", "vmware", "msft", "iscsi", "loop", "synthetic",
];

/// Parse one smartctl run. `sticky` is the previously verified parser type
/// for this device, which wins over whatever this run claims to be.
pub fn parse_output(
    json: &str,
    sticky: Option<ParserType>,
) -> Result<(SmartData, ParserType), serde_json::Error> {
    let output: SmartctlOutput = serde_json::from_str(json)?;
    let parser = sticky.unwrap_or_else(|| classify(&output));

    let mut data = SmartData {
        device_name: output
            .device
            .as_ref()
            .and_then(|d| d.name.clone())
            .unwrap_or_default(),
        device_type: parser.as_str().to_string(),
        serial_number: output.serial_number.clone().unwrap_or_default(),
        model_name: output
            .model_name
            .clone()
            .or_else(|| output.product.clone())
            .unwrap_or_default(),
        capacity: output.user_capacity.as_ref().and_then(|c| c.bytes).unwrap_or(0),
        status: match output.smart_status.as_ref().and_then(|s| s.passed) {
            Some(true) => "PASSED".to_string(),
            Some(false) => "FAILED".to_string(),
            None => String::new(),
        },
        temperature: output
            .temperature
            .as_ref()
            .and_then(|t| t.current)
            .unwrap_or(0),
        attributes: Vec::new(),
    };

    data.attributes = match parser {
        ParserType::Sata => sata_attributes(&output),
        ParserType::Nvme => nvme_attributes(&output),
        ParserType::Scsi => scsi_attributes(&output),
        ParserType::Emmc => Vec::new(),
    };

    // NVMe reports temperature inside the health log, not at top level.
    if data.temperature == 0 {
        if let Some(log) = &output.nvme_smart_health_information_log {
            data.temperature = log.temperature.unwrap_or(0);
        }
    }

    Ok((data, parser))
}

/// True when the device looks like a hypervisor artifact rather than a
/// physical disk.
pub fn is_virtual(output_json: &str) -> bool {
    let Ok(output) = serde_json::from_str::<SmartctlOutput>(output_json) else {
        return false;
    };
    let result = [
        output.model_name.as_deref(),
        output.model_family.as_deref(),
        output.vendor.as_deref(),
        output.product.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|field| {
        let lower = field.to_ascii_lowercase();
        VIRTUAL_MARKERS.iter().any(|marker| lower.contains(marker))
    });
    result
}

fn classify(output: &SmartctlOutput) -> ParserType {
    if output.nvme_smart_health_information_log.is_some() {
        return ParserType::Nvme;
    }
    let device = output.device.as_ref();
    let protocol = device
        .and_then(|d| d.protocol.as_deref())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let device_type = device
        .and_then(|d| d.device_type.as_deref())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let name = device
        .and_then(|d| d.name.as_deref())
        .unwrap_or_default();

    if protocol.contains("nvme") || device_type.contains("nvme") {
        ParserType::Nvme
    } else if device_type.contains("mmc") || name.contains("mmcblk") {
        ParserType::Emmc
    } else if protocol.contains("scsi") && !device_type.contains("sat") {
        ParserType::Scsi
    } else {
        ParserType::Sata
    }
}

fn sata_attributes(output: &SmartctlOutput) -> Vec<SmartAttribute> {
    let Some(table) = output
        .ata_smart_attributes
        .as_ref()
        .and_then(|a| a.table.as_ref())
    else {
        return Vec::new();
    };
    table
        .iter()
        .filter_map(|attr| {
            Some(SmartAttribute {
                id: attr.id,
                name: attr.name.clone()?,
                value: attr.value,
                worst: attr.worst,
                threshold: attr.thresh,
                raw_value: attr.raw.as_ref().and_then(|r| r.value),
            })
        })
        .collect()
}

fn nvme_attributes(output: &SmartctlOutput) -> Vec<SmartAttribute> {
    let Some(log) = &output.nvme_smart_health_information_log else {
        return Vec::new();
    };
    let named = |name: &str, value: Option<i64>| SmartAttribute {
        id: None,
        name: name.to_string(),
        value,
        worst: None,
        threshold: None,
        raw_value: value,
    };
    vec![
        named("CriticalWarning", log.critical_warning),
        named("AvailableSpare", log.available_spare),
        named("PercentageUsed", log.percentage_used),
        named("DataUnitsRead", log.data_units_read),
        named("DataUnitsWritten", log.data_units_written),
        named("PowerCycles", log.power_cycles),
        named("PowerOnHours", log.power_on_hours),
        named("UnsafeShutdowns", log.unsafe_shutdowns),
        named("MediaErrors", log.media_errors),
    ]
}

fn scsi_attributes(output: &SmartctlOutput) -> Vec<SmartAttribute> {
    let mut attrs = Vec::new();
    if let Some(defects) = output.scsi_grown_defect_list {
        attrs.push(SmartAttribute {
            id: None,
            name: "GrownDefects".to_string(),
            value: Some(defects),
            worst: None,
            threshold: None,
            raw_value: Some(defects),
        });
    }
    if let Some(hours) = output.power_on_time.as_ref().and_then(|p| p.hours) {
        attrs.push(SmartAttribute {
            id: None,
            name: "PowerOnHours".to_string(),
            value: Some(hours),
            worst: None,
            threshold: None,
            raw_value: Some(hours),
        });
    }
    attrs
}
