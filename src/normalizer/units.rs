/// Per-source rescaling of measured values, e.g. 10,000 kWh → MWh is ×10.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitConversion {
    pub factor: f64,
    /// Only set when a source's demand column is published in a different unit.
    pub demand_factor: Option<f64>,
    pub unit: String,
}

impl UnitConversion {
    pub fn new(factor: f64, unit: impl Into<String>) -> Self {
        Self {
            factor,
            demand_factor: None,
            unit: unit.into(),
        }
    }

    pub fn with_demand_factor(mut self, factor: f64) -> Self {
        self.demand_factor = Some(factor);
        self
    }

    pub fn is_valid(&self) -> bool {
        let ok = |f: f64| f.is_finite() && f != 0.0;
        ok(self.factor) && self.demand_factor.is_none_or(ok) && !self.unit.trim().is_empty()
    }

    pub fn demand(&self, value: Option<f64>) -> Option<f64> {
        value.map(|v| v * self.demand_factor.unwrap_or(self.factor))
    }

    pub fn series(&self, value: Option<f64>) -> Option<f64> {
        value.map(|v| v * self.factor)
    }
}
