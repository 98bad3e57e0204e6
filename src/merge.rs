//! Concatenates per-task files along the time axis, strictly in input order.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::dataset::{LAT_CANDIDATES, LON_CANDIDATES, TIME_CANDIDATES};
use crate::error::TellusError;
use crate::netcdf::{ModelVar, NcModel, NcReader, NcType, VarData, write_classic};

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub output: String,
    pub files: usize,
    pub records: usize,
    pub variables: Vec<String>,
}

/// Inputs must agree on variable set, grid coordinates and packing; any
/// disagreement is a `MergeMismatch` and no output file is created. The
/// first file becomes the template and every later file appends its
/// records, so the merged time order is the input order.
pub fn merge_along_time(
    inputs: &[Utf8PathBuf],
    destination: &Utf8Path,
) -> Result<MergeOutcome, TellusError> {
    let first = inputs
        .first()
        .ok_or_else(|| TellusError::Merge("no input files to merge".to_string()))?;

    let mut base = read_model(first)?;
    let axis = concat_axis(&base)
        .ok_or_else(|| TellusError::Merge(format!("{first}: no time dimension to merge along")))?;
    normalize_axis(&mut base, axis, first)?;

    let mut records = initial_records(&base, first)?;
    let signature = Signature::of(&base);

    for path in &inputs[1..] {
        let other = read_model(path)?;
        signature.check(&Signature::of(&other), path)?;
        records += append_records(&mut base, &other, path)?;
    }

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
    }
    write_classic(destination.as_std_path(), &base)?;

    Ok(MergeOutcome {
        output: destination.to_string(),
        files: inputs.len(),
        records,
        variables: data_variable_names(&base),
    })
}

fn read_model(path: &Utf8Path) -> Result<NcModel, TellusError> {
    NcReader::open(path.as_std_path())?.to_model()
}

/// The named time dimension, or failing that the unlimited one.
fn concat_axis(model: &NcModel) -> Option<usize> {
    TIME_CANDIDATES
        .iter()
        .find_map(|name| {
            model
                .dimensions
                .iter()
                .position(|dim| dim.name == *name)
        })
        .or_else(|| model.dimensions.iter().position(|dim| dim.unlimited))
}

/// Marks the concat axis as the record dimension so appended data grows the
/// file, whether or not the source file stored time as unlimited.
fn normalize_axis(model: &mut NcModel, axis: usize, path: &Utf8Path) -> Result<(), TellusError> {
    if let Some(stray) = model
        .dimensions
        .iter()
        .position(|dim| dim.unlimited)
        .filter(|pos| *pos != axis)
    {
        return Err(TellusError::Merge(format!(
            "{path}: unlimited dimension {} is not the time axis",
            model.dimensions[stray].name
        )));
    }
    let dim = &mut model.dimensions[axis];
    dim.unlimited = true;
    dim.len = 0;
    Ok(())
}

fn initial_records(base: &NcModel, path: &Utf8Path) -> Result<usize, TellusError> {
    for var in &base.variables {
        if !base.is_record(var) {
            continue;
        }
        let per = base.per_record_elements(var);
        if per == 0 || var.data.len() % per != 0 {
            return Err(TellusError::Merge(format!(
                "{path}: variable {} is not a whole number of time steps",
                var.name
            )));
        }
        return Ok(var.data.len() / per);
    }
    Err(TellusError::Merge(format!(
        "{path}: no variables laid out along time"
    )))
}

fn append_records(
    base: &mut NcModel,
    other: &NcModel,
    path: &Utf8Path,
) -> Result<usize, TellusError> {
    let other_axis = concat_axis(other)
        .ok_or_else(|| TellusError::Merge(format!("{path}: no time dimension to merge along")))?;

    let record_indexes: Vec<usize> = (0..base.variables.len())
        .filter(|idx| base.is_record(&base.variables[*idx]))
        .collect();

    let mut appended: Option<usize> = None;
    for idx in record_indexes {
        let name = base.variables[idx].name.clone();
        let per = base.per_record_elements(&base.variables[idx]);
        if per == 0 {
            return Err(TellusError::Merge(format!(
                "{path}: variable {name} spans a zero-length dimension"
            )));
        }

        let other_var = other.variable(&name).ok_or_else(|| {
            TellusError::MergeMismatch(format!("{path}: variable {name} is missing"))
        })?;
        if other_var.dims.first().copied() != Some(other_axis) {
            return Err(TellusError::MergeMismatch(format!(
                "{path}: variable {name} is not laid out along time"
            )));
        }
        let other_per = other.per_record_elements(other_var);
        if other_per != per {
            return Err(TellusError::MergeMismatch(format!(
                "{path}: variable {name} has {other_per} points per step, expected {per}"
            )));
        }
        if other_var.data.len() % other_per != 0 {
            return Err(TellusError::Merge(format!(
                "{path}: variable {name} is not a whole number of time steps"
            )));
        }

        let contributed = other_var.data.len() / other_per;
        match appended {
            None => appended = Some(contributed),
            Some(existing) if existing != contributed => {
                return Err(TellusError::Merge(format!(
                    "{path}: variables disagree on the number of time steps"
                )));
            }
            Some(_) => {}
        }

        match (&mut base.variables[idx].data, &other_var.data) {
            (VarData::Numeric(dst), VarData::Numeric(src)) => dst.extend_from_slice(src),
            (VarData::Text(dst), VarData::Text(src)) => dst.extend_from_slice(src),
            _ => {
                return Err(TellusError::MergeMismatch(format!(
                    "{path}: variable {name} storage type differs"
                )));
            }
        }
    }

    appended.ok_or_else(|| {
        TellusError::Merge(format!("{path}: no variables laid out along time"))
    })
}

fn data_variable_names(model: &NcModel) -> Vec<String> {
    model
        .variables
        .iter()
        .filter(|var| {
            !model
                .dimensions
                .iter()
                .any(|dim| dim.name == var.name)
        })
        .map(|var| var.name.clone())
        .collect()
}

fn number_attr(var: &ModelVar, name: &str) -> Option<f64> {
    var.attributes
        .iter()
        .find(|attr| attr.name == name)
        .and_then(|attr| attr.value.first_number())
}

fn coordinate_values(model: &NcModel, candidates: &[&str]) -> Option<Vec<f64>> {
    candidates.iter().find_map(|name| {
        model.variable(name).and_then(|var| match &var.data {
            VarData::Numeric(values) => Some(values.clone()),
            VarData::Text(_) => None,
        })
    })
}

/// What every input must agree on before any data moves.
struct Signature {
    variables: BTreeMap<String, NcType>,
    latitude: Option<Vec<f64>>,
    longitude: Option<Vec<f64>>,
    packing: BTreeMap<String, (Option<f64>, Option<f64>)>,
}

impl Signature {
    fn of(model: &NcModel) -> Self {
        let variables = model
            .variables
            .iter()
            .map(|var| (var.name.clone(), var.nc_type))
            .collect();
        let packing = model
            .variables
            .iter()
            .map(|var| {
                (
                    var.name.clone(),
                    (
                        number_attr(var, "scale_factor"),
                        number_attr(var, "add_offset"),
                    ),
                )
            })
            .collect();
        Self {
            variables,
            latitude: coordinate_values(model, &LAT_CANDIDATES),
            longitude: coordinate_values(model, &LON_CANDIDATES),
            packing,
        }
    }

    fn check(&self, other: &Signature, path: &Utf8Path) -> Result<(), TellusError> {
        if self.variables != other.variables {
            let expected: Vec<&str> = self.variables.keys().map(String::as_str).collect();
            let found: Vec<&str> = other.variables.keys().map(String::as_str).collect();
            return Err(TellusError::MergeMismatch(format!(
                "{path}: variable set [{}] does not match [{}]",
                found.join(", "),
                expected.join(", ")
            )));
        }
        if self.latitude != other.latitude {
            return Err(TellusError::MergeMismatch(format!(
                "{path}: latitude grid differs from the first input"
            )));
        }
        if self.longitude != other.longitude {
            return Err(TellusError::MergeMismatch(format!(
                "{path}: longitude grid differs from the first input"
            )));
        }
        for (name, packing) in &self.packing {
            if other.packing.get(name) != Some(packing) {
                return Err(TellusError::MergeMismatch(format!(
                    "{path}: variable {name} is packed with a different scale or offset"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::netcdf::{Attribute, Dimension};

    fn grid_file(path: &Utf8Path, times: &[f64], temps: &[f64]) -> Utf8PathBuf {
        let model = grid_model(times, temps, &[10.0, 20.0], 0.01);
        write_classic(path.as_std_path(), &model).unwrap();
        path.to_owned()
    }

    fn grid_model(times: &[f64], temps: &[f64], lats: &[f64], scale: f64) -> NcModel {
        assert_eq!(temps.len(), times.len() * 4);
        NcModel {
            dimensions: vec![
                Dimension::fixed("time", times.len()),
                Dimension::fixed("latitude", 2),
                Dimension::fixed("longitude", 2),
            ],
            attributes: vec![Attribute::text("Conventions", "CF-1.6")],
            variables: vec![
                ModelVar {
                    name: "time".to_string(),
                    dims: vec![0],
                    attributes: vec![Attribute::text("units", "hours since 2014-01-01")],
                    nc_type: NcType::Double,
                    data: VarData::Numeric(times.to_vec()),
                },
                ModelVar {
                    name: "latitude".to_string(),
                    dims: vec![1],
                    attributes: Vec::new(),
                    nc_type: NcType::Double,
                    data: VarData::Numeric(lats.to_vec()),
                },
                ModelVar {
                    name: "longitude".to_string(),
                    dims: vec![2],
                    attributes: Vec::new(),
                    nc_type: NcType::Double,
                    data: VarData::Numeric(vec![30.0, 40.0]),
                },
                ModelVar {
                    name: "t2m".to_string(),
                    dims: vec![0, 1, 2],
                    attributes: vec![Attribute::double("scale_factor", scale)],
                    nc_type: NcType::Float,
                    data: VarData::Numeric(temps.to_vec()),
                },
            ],
        }
    }

    fn utf8(path: std::path::PathBuf) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    #[test]
    fn concatenates_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let january = grid_file(
            &utf8(dir.path().join("jan.nc")),
            &[0.0, 1.0],
            &[1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5],
        );
        let february = grid_file(
            &utf8(dir.path().join("feb.nc")),
            &[2.0, 3.0],
            &[11.5, 12.5, 13.5, 14.5, 15.5, 16.5, 17.5, 18.5],
        );
        let destination = utf8(dir.path().join("merged.nc"));

        let outcome =
            merge_along_time(&[january, february], &destination).unwrap();
        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.records, 4);
        assert_eq!(outcome.variables, vec!["t2m".to_string()]);

        let mut reader = NcReader::open(destination.as_std_path()).unwrap();
        assert_eq!(reader.num_records, 4);
        let time_idx = reader.find("time").unwrap();
        assert_eq!(
            reader.read_values(time_idx).unwrap(),
            vec![0.0, 1.0, 2.0, 3.0]
        );
        let t2m_idx = reader.find("t2m").unwrap();
        let temps = reader.read_values(t2m_idx).unwrap();
        assert_eq!(temps.len(), 16);
        assert_eq!(temps[0], 1.5);
        assert_eq!(temps[8], 11.5);
        let lat_idx = reader.find("latitude").unwrap();
        assert_eq!(reader.read_values(lat_idx).unwrap(), vec![10.0, 20.0]);
    }

    #[test]
    fn single_input_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let january = grid_file(
            &utf8(dir.path().join("jan.nc")),
            &[0.0, 1.0],
            &[1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5],
        );
        let destination = utf8(dir.path().join("merged.nc"));

        let outcome = merge_along_time(&[january], &destination).unwrap();
        assert_eq!(outcome.records, 2);
        assert!(destination.as_std_path().exists());
    }

    #[test]
    fn empty_input_list_is_an_error() {
        let destination = Utf8PathBuf::from("/tmp/never-written.nc");
        let result = merge_along_time(&[], &destination);
        assert_matches!(result, Err(TellusError::Merge(_)));
    }

    #[test]
    fn variable_set_mismatch_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let january = grid_file(
            &utf8(dir.path().join("jan.nc")),
            &[0.0, 1.0],
            &[1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5],
        );

        let mut other = grid_model(&[2.0, 3.0], &[1.0; 8], &[10.0, 20.0], 0.01);
        other.variables[3].name = "tp".to_string();
        let february = utf8(dir.path().join("feb.nc"));
        write_classic(february.as_std_path(), &other).unwrap();

        let destination = utf8(dir.path().join("merged.nc"));
        let result = merge_along_time(&[january, february], &destination);
        assert_matches!(result, Err(TellusError::MergeMismatch(_)));
        assert!(!destination.as_std_path().exists());
    }

    #[test]
    fn grid_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let january = grid_file(
            &utf8(dir.path().join("jan.nc")),
            &[0.0, 1.0],
            &[1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5],
        );

        let shifted = grid_model(&[2.0, 3.0], &[1.0; 8], &[11.0, 21.0], 0.01);
        let february = utf8(dir.path().join("feb.nc"));
        write_classic(february.as_std_path(), &shifted).unwrap();

        let destination = utf8(dir.path().join("merged.nc"));
        let result = merge_along_time(&[january, february], &destination);
        assert_matches!(result, Err(TellusError::MergeMismatch(message)) if message.contains("latitude"));
        assert!(!destination.as_std_path().exists());
    }

    #[test]
    fn packing_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let january = grid_file(
            &utf8(dir.path().join("jan.nc")),
            &[0.0, 1.0],
            &[1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5],
        );

        let repacked = grid_model(&[2.0, 3.0], &[1.0; 8], &[10.0, 20.0], 0.02);
        let february = utf8(dir.path().join("feb.nc"));
        write_classic(february.as_std_path(), &repacked).unwrap();

        let destination = utf8(dir.path().join("merged.nc"));
        let result = merge_along_time(&[january, february], &destination);
        assert_matches!(result, Err(TellusError::MergeMismatch(message)) if message.contains("scale"));
        assert!(!destination.as_std_path().exists());
    }
}
