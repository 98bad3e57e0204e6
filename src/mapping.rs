use std::collections::HashMap;

/// ERA5-Land archive request names and the short names the archive actually
/// stores in the delivered files.
const DEFAULT_TABLE: &[(&str, &str)] = &[
    ("2m_temperature", "t2m"),
    ("2m_dewpoint_temperature", "d2m"),
    ("skin_temperature", "skt"),
    ("soil_temperature_level_1", "stl1"),
    ("soil_temperature_level_2", "stl2"),
    ("soil_temperature_level_3", "stl3"),
    ("soil_temperature_level_4", "stl4"),
    ("surface_solar_radiation_downwards", "ssrd"),
    ("surface_thermal_radiation_downwards", "strd"),
    ("surface_net_solar_radiation", "ssr"),
    ("surface_net_thermal_radiation", "str"),
    ("surface_solar_radiation_downward_clear_sky", "ssrdc"),
    ("surface_thermal_radiation_downward_clear_sky", "strdc"),
    ("10m_u_component_of_wind", "u10"),
    ("10m_v_component_of_wind", "v10"),
    ("total_precipitation", "tp"),
    ("snowfall", "sf"),
    ("surface_pressure", "sp"),
    ("surface_runoff", "sro"),
    ("sub_surface_runoff", "ssro"),
    ("volumetric_soil_water_layer_1", "swvl1"),
    ("volumetric_soil_water_layer_2", "swvl2"),
    ("volumetric_soil_water_layer_3", "swvl3"),
    ("volumetric_soil_water_layer_4", "swvl4"),
    ("leaf_area_index_high_vegetation", "lai_hv"),
    ("leaf_area_index_low_vegetation", "lai_lv"),
    ("snow_depth", "sd"),
    ("snow_cover", "snowc"),
    ("evaporation", "e"),
    ("potential_evaporation", "pev"),
    ("runoff", "ro"),
    ("total_evaporation", "e"),
];

/// Archive-side name to stored-file-side name lookup. Names without an entry
/// map to themselves.
#[derive(Debug, Clone)]
pub struct VariableMapping {
    table: HashMap<String, String>,
}

impl VariableMapping {
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut mapping = Self::default();
        for (archive_name, stored_name) in overrides {
            mapping
                .table
                .insert(archive_name.clone(), stored_name.clone());
        }
        mapping
    }

    /// Short name the archive stores this variable under.
    pub fn resolve<'a>(&'a self, archive_name: &'a str) -> &'a str {
        self.table
            .get(archive_name)
            .map(String::as_str)
            .unwrap_or(archive_name)
    }

    /// Names a delivered file may legitimately use for this variable, mapped
    /// name first.
    pub fn candidates<'a>(&'a self, archive_name: &'a str) -> Vec<&'a str> {
        let mapped = self.resolve(archive_name);
        if mapped == archive_name {
            vec![archive_name]
        } else {
            vec![mapped, archive_name]
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for VariableMapping {
    fn default() -> Self {
        let table = DEFAULT_TABLE
            .iter()
            .map(|(archive_name, stored_name)| (archive_name.to_string(), stored_name.to_string()))
            .collect();
        Self { table }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_and_unknown_names() {
        let mapping = VariableMapping::default();
        assert_eq!(mapping.resolve("2m_temperature"), "t2m");
        assert_eq!(mapping.resolve("total_precipitation"), "tp");
        assert_eq!(mapping.resolve("made_up_variable"), "made_up_variable");
    }

    #[test]
    fn candidates_prefer_mapped_name() {
        let mapping = VariableMapping::default();
        assert_eq!(
            mapping.candidates("snow_depth"),
            vec!["sd", "snow_depth"]
        );
        assert_eq!(mapping.candidates("xyz"), vec!["xyz"]);
    }

    #[test]
    fn overrides_shadow_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert("2m_temperature".to_string(), "temp2m".to_string());
        overrides.insert("my_custom".to_string(), "mc".to_string());
        let mapping = VariableMapping::with_overrides(&overrides);
        assert_eq!(mapping.resolve("2m_temperature"), "temp2m");
        assert_eq!(mapping.resolve("my_custom"), "mc");
        assert_eq!(mapping.resolve("snowfall"), "sf");
    }
}
