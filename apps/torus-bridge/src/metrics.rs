#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    InputVoltage,
    OutputVoltage,
    OutputCurrent,
    OutputPower,
    ThdPercent,
}

/// One reading of the power conditioner, from either the portal or the LAN device.
///
/// Every field is independent; a missing field is simply not published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsRecord {
    pub input_voltage: Option<f64>,
    pub output_voltage: Option<f64>,
    pub output_current: Option<f64>,
    /// Watts.
    pub output_power: Option<f64>,
    pub thd_percent: Option<f64>,
    /// UTC epoch seconds, already corrected for the device's timezone.
    pub device_timestamp: Option<i64>,
}

impl MetricsRecord {
    pub fn set(&mut self, field: Field, value: Option<f64>) {
        match field {
            Field::InputVoltage => self.input_voltage = value,
            Field::OutputVoltage => self.output_voltage = value,
            Field::OutputCurrent => self.output_current = value,
            Field::OutputPower => self.output_power = value,
            Field::ThdPercent => self.thd_percent = value,
        }
    }

    /// Replace the four electrical readings with the local device's values.
    ///
    /// THD and the device timestamp only come from the portal and are kept.
    pub fn overlay_local(&mut self, local: &MetricsRecord) {
        self.input_voltage = local.input_voltage;
        self.output_voltage = local.output_voltage;
        self.output_current = local.output_current;
        self.output_power = local.output_power;
    }

    /// A sample is worth publishing only with an input voltage or a device timestamp.
    pub fn is_publishable(&self) -> bool {
        self.input_voltage.is_some() || self.device_timestamp.is_some()
    }
}
