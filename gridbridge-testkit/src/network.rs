//! In-memory grid model backing the fake engine's network objects.
//!
//! Each element type is a table of series whose first column is the `id`
//! index, the same shape the engine exchanges over the boundary.

use std::collections::BTreeMap;

use gridbridge::{ElementType, Series, SeriesValues};

pub const EUROSTAG_FACTORY: &str = "eurostag_tutorial_example1";
pub const EMPTY_FACTORY: &str = "empty";

fn strings(values: &[&str]) -> SeriesValues {
    SeriesValues::Strings(values.iter().map(|v| (*v).to_string()).collect())
}

fn ids(values: &[&str]) -> Series {
    Series::index("id", strings(values))
}

#[derive(Debug, Clone)]
pub struct FakeNetwork {
    pub name: String,
    tables: BTreeMap<ElementType, Vec<Series>>,
}

impl FakeNetwork {
    pub fn from_factory(factory: &str) -> Option<Self> {
        match factory {
            EUROSTAG_FACTORY => Some(Self::eurostag()),
            EMPTY_FACTORY => {
                let mut network = Self::eurostag();
                network.name = EMPTY_FACTORY.to_string();
                for table in network.tables.values_mut() {
                    for series in table {
                        series.values = clear(&series.values);
                    }
                }
                Some(network)
            }
            _ => None,
        }
    }

    fn eurostag() -> Self {
        let tables = BTreeMap::from([
            (
                ElementType::Bus,
                vec![
                    ids(&["VLGEN_0", "VLHV1_0", "VLHV2_0", "VLLOAD_0"]),
                    Series::new("v_mag", SeriesValues::Doubles(vec![24.5, 402.1, 389.9, 147.6])),
                    Series::new("voltage_level_id", strings(&["VLGEN", "VLHV1", "VLHV2", "VLLOAD"])),
                    Series::new("connected_component", SeriesValues::Ints(vec![0, 0, 0, 0])),
                ],
            ),
            (
                ElementType::Line,
                vec![
                    ids(&["NHV1_NHV2_1", "NHV1_NHV2_2"]),
                    Series::new("r", SeriesValues::Doubles(vec![3.0, 3.0])),
                    Series::new("x", SeriesValues::Doubles(vec![33.0, 33.0])),
                    Series::new("connected", SeriesValues::Bools(vec![true, true])),
                ],
            ),
            (
                ElementType::TwoWindingsTransformer,
                vec![
                    ids(&["NGEN_NHV1", "NHV2_NLOAD"]),
                    Series::new("rated_u1", SeriesValues::Doubles(vec![24.0, 400.0])),
                    Series::new("rated_u2", SeriesValues::Doubles(vec![400.0, 158.0])),
                ],
            ),
            (
                ElementType::Generator,
                vec![
                    ids(&["GEN", "GEN2"]),
                    Series::new("target_p", SeriesValues::Doubles(vec![607.0, 300.0])),
                    Series::new("target_v", SeriesValues::Doubles(vec![24.5, 24.5])),
                    Series::new("voltage_regulator_on", SeriesValues::Bools(vec![true, false])),
                ],
            ),
            (
                ElementType::Load,
                vec![
                    ids(&["LOAD"]),
                    Series::new("p0", SeriesValues::Doubles(vec![600.0])),
                    Series::new("q0", SeriesValues::Doubles(vec![200.0])),
                    Series::new("voltage_level_id", strings(&["VLLOAD"])),
                ],
            ),
            (
                ElementType::Substation,
                vec![
                    ids(&["P1", "P2"]),
                    Series::new("country", strings(&["FR", "BE"])),
                ],
            ),
            (
                ElementType::VoltageLevel,
                vec![
                    ids(&["VLGEN", "VLHV1", "VLHV2", "VLLOAD"]),
                    Series::new("substation_id", strings(&["P1", "P1", "P2", "P2"])),
                    Series::new("nominal_v", SeriesValues::Doubles(vec![24.0, 380.0, 380.0, 150.0])),
                ],
            ),
        ]);
        Self {
            name: EUROSTAG_FACTORY.to_string(),
            tables,
        }
    }

    pub fn table(&self, element_type: ElementType) -> Result<&[Series], String> {
        self.tables
            .get(&element_type)
            .map(Vec::as_slice)
            .ok_or_else(|| format!("No table for element type {element_type:?}"))
    }

    pub fn ids(&self, element_type: ElementType) -> Result<Vec<String>, String> {
        index_ids(self.table(element_type)?)
    }

    /// Sub-network around one voltage level: a copy named after it.
    pub fn sub_network(&self, voltage_level: &str) -> Result<Self, String> {
        if !self.ids(ElementType::VoltageLevel)?.iter().any(|id| id == voltage_level) {
            return Err(format!("Voltage level '{voltage_level}' not found"));
        }
        Ok(Self {
            name: format!("{}/{voltage_level}", self.name),
            tables: self.tables.clone(),
        })
    }

    /// Overwrite attributes of existing elements selected by the index column.
    pub fn update(&mut self, element_type: ElementType, frame: &[Series]) -> Result<(), String> {
        let known = self.ids(element_type)?;
        let rows = index_ids(frame)?
            .iter()
            .map(|id| {
                known
                    .iter()
                    .position(|candidate| candidate == id)
                    .ok_or_else(|| format!("{element_type:?} '{id}' not found"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut table = self.table(element_type)?.to_vec();
        for column in frame.iter().filter(|s| !s.index) {
            let target = table
                .iter_mut()
                .find(|s| s.name == column.name)
                .ok_or_else(|| format!("No attribute '{}' for {element_type:?}", column.name))?;
            assign(&mut target.values, &column.values, &rows)
                .map_err(|reason| format!("Attribute '{}': {reason}", column.name))?;
        }
        self.tables.insert(element_type, table);
        Ok(())
    }

    /// Append the rows of every frame. Attributes absent from a frame get
    /// their default value.
    pub fn create(&mut self, element_type: ElementType, frames: &[Vec<Series>]) -> Result<(), String> {
        let mut table = self.table(element_type)?.to_vec();
        let mut known = index_ids(&table)?;
        for frame in frames {
            let new_ids = index_ids(frame)?;
            if let Some(id) = new_ids.iter().find(|id| known.contains(id)) {
                return Err(format!("{element_type:?} '{id}' already exists"));
            }
            for row in 0..new_ids.len() {
                for target in &mut table {
                    let source = frame.iter().find(|s| s.name == target.name);
                    push_row(&mut target.values, source.map(|s| &s.values), row)
                        .map_err(|reason| format!("Attribute '{}': {reason}", target.name))?;
                }
            }
            known.extend(new_ids);
        }
        self.tables.insert(element_type, table);
        Ok(())
    }
}

fn index_ids(frame: &[Series]) -> Result<Vec<String>, String> {
    match frame.iter().find(|s| s.index).map(|s| &s.values) {
        Some(SeriesValues::Strings(ids)) => Ok(ids.clone()),
        Some(_) => Err("index column must contain strings".to_string()),
        None => Err("missing index column".to_string()),
    }
}

fn clear(values: &SeriesValues) -> SeriesValues {
    match values {
        SeriesValues::Strings(_) => SeriesValues::Strings(Vec::new()),
        SeriesValues::Doubles(_) => SeriesValues::Doubles(Vec::new()),
        SeriesValues::Ints(_) => SeriesValues::Ints(Vec::new()),
        SeriesValues::Bools(_) => SeriesValues::Bools(Vec::new()),
    }
}

fn assign(target: &mut SeriesValues, source: &SeriesValues, rows: &[usize]) -> Result<(), String> {
    fn copy<T: Clone>(target: &mut [T], source: &[T], rows: &[usize]) {
        for (&row, value) in rows.iter().zip(source) {
            target[row] = value.clone();
        }
    }
    match (target, source) {
        (SeriesValues::Strings(t), SeriesValues::Strings(s)) => copy(t, s, rows),
        (SeriesValues::Doubles(t), SeriesValues::Doubles(s)) => copy(t, s, rows),
        (SeriesValues::Ints(t), SeriesValues::Ints(s)) => copy(t, s, rows),
        (SeriesValues::Bools(t), SeriesValues::Bools(s)) => copy(t, s, rows),
        (t, s) => {
            return Err(format!(
                "expected {:?} values, got {:?}",
                t.series_type(),
                s.series_type()
            ));
        }
    }
    Ok(())
}

fn push_row(target: &mut SeriesValues, source: Option<&SeriesValues>, row: usize) -> Result<(), String> {
    fn push<T: Clone>(target: &mut Vec<T>, source: Option<&Vec<T>>, row: usize, default: T) {
        target.push(source.and_then(|s| s.get(row)).cloned().unwrap_or(default));
    }
    match (target, source) {
        (SeriesValues::Strings(t), None) => push(t, None, row, String::new()),
        (SeriesValues::Strings(t), Some(SeriesValues::Strings(s))) => push(t, Some(s), row, String::new()),
        (SeriesValues::Doubles(t), None) => push(t, None, row, f64::NAN),
        (SeriesValues::Doubles(t), Some(SeriesValues::Doubles(s))) => push(t, Some(s), row, f64::NAN),
        (SeriesValues::Ints(t), None) => push(t, None, row, 0),
        (SeriesValues::Ints(t), Some(SeriesValues::Ints(s))) => push(t, Some(s), row, 0),
        (SeriesValues::Bools(t), None) => push(t, None, row, false),
        (SeriesValues::Bools(t), Some(SeriesValues::Bools(s))) => push(t, Some(s), row, false),
        (t, Some(s)) => {
            return Err(format!(
                "expected {:?} values, got {:?}",
                t.series_type(),
                s.series_type()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_rejects_unknown_element() {
        let mut network = FakeNetwork::from_factory(EUROSTAG_FACTORY).unwrap();
        let frame = vec![
            ids(&["GEN3"]),
            Series::new("target_p", SeriesValues::Doubles(vec![1.0])),
        ];
        let err = network.update(ElementType::Generator, &frame).unwrap_err();
        assert_eq!(err, "Generator 'GEN3' not found");
    }

    #[test]
    fn create_fills_missing_attributes() {
        let mut network = FakeNetwork::from_factory(EMPTY_FACTORY).unwrap();
        let frame = vec![ids(&["L1"]), Series::new("p0", SeriesValues::Doubles(vec![10.0]))];
        network.create(ElementType::Load, &[frame]).unwrap();
        let loads = network.table(ElementType::Load).unwrap();
        assert_eq!(loads[3].values, strings(&[""]));
        assert_eq!(network.ids(ElementType::Load).unwrap(), vec!["L1"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut network = FakeNetwork::from_factory(EUROSTAG_FACTORY).unwrap();
        let err = network
            .create(ElementType::Load, &[vec![ids(&["LOAD"])]])
            .unwrap_err();
        assert_eq!(err, "Load 'LOAD' already exists");
    }
}
