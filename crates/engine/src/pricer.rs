use meter_core::PriceTable;

/// Seam between the delta engine and whatever supplies prices; the engine
/// only ever needs this one pure call.
pub trait Pricer {
    fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64;
}

impl Pricer for PriceTable {
    fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        PriceTable::cost(self, model, input_tokens, output_tokens)
    }
}
