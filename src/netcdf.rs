//! Reader and writer for the NetCDF classic format (CDF-1 and CDF-2).
//!
//! Covers the subset the archive delivers: big-endian scalars, one optional
//! unlimited (record) dimension, attributes on variables and on the file.
//! HDF5-backed NetCDF-4 files are rejected at open.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::TellusError;

const STREAMING: u32 = 0xFFFF_FFFF;
const TAG_DIMENSION: u32 = 0x0A;
const TAG_VARIABLE: u32 = 0x0B;
const TAG_ATTRIBUTE: u32 = 0x0C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
}

impl NcType {
    pub fn size(self) -> usize {
        match self {
            NcType::Byte | NcType::Char => 1,
            NcType::Short => 2,
            NcType::Int | NcType::Float => 4,
            NcType::Double => 8,
        }
    }

    fn code(self) -> u32 {
        match self {
            NcType::Byte => 1,
            NcType::Char => 2,
            NcType::Short => 3,
            NcType::Int => 4,
            NcType::Float => 5,
            NcType::Double => 6,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(NcType::Byte),
            2 => Some(NcType::Char),
            3 => Some(NcType::Short),
            4 => Some(NcType::Int),
            5 => Some(NcType::Float),
            6 => Some(NcType::Double),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Bytes(Vec<u8>),
    Shorts(Vec<i16>),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Doubles(Vec<f64>),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn first_number(&self) -> Option<f64> {
        match self {
            AttrValue::Text(_) => None,
            AttrValue::Bytes(values) => values.first().map(|v| *v as f64),
            AttrValue::Shorts(values) => values.first().map(|v| *v as f64),
            AttrValue::Ints(values) => values.first().map(|v| *v as f64),
            AttrValue::Floats(values) => values.first().map(|v| *v as f64),
            AttrValue::Doubles(values) => values.first().copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttrValue,
}

impl Attribute {
    pub fn text(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: AttrValue::Text(value.to_string()),
        }
    }

    pub fn double(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value: AttrValue::Doubles(vec![value]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub len: usize,
    pub unlimited: bool,
}

impl Dimension {
    pub fn fixed(name: &str, len: usize) -> Self {
        Self {
            name: name.to_string(),
            len,
            unlimited: false,
        }
    }

    pub fn unlimited(name: &str) -> Self {
        Self {
            name: name.to_string(),
            len: 0,
            unlimited: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VarMeta {
    pub name: String,
    pub dim_ids: Vec<usize>,
    pub attributes: Vec<Attribute>,
    pub nc_type: NcType,
    begin: u64,
}

impl VarMeta {
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| &attr.value)
    }
}

/// Sequential header parse, then seek-based value access.
#[derive(Debug)]
pub struct NcReader {
    path: String,
    reader: BufReader<File>,
    pub version: u8,
    pub num_records: usize,
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub variables: Vec<VarMeta>,
    recsize: u64,
}

impl NcReader {
    pub fn open(path: &Path) -> Result<Self, TellusError> {
        let display = path.display().to_string();
        Self::open_inner(path).map_err(|message| TellusError::Dataset {
            path: display,
            message,
        })
    }

    fn open_inner(path: &Path) -> Result<Self, String> {
        let file = File::open(path).map_err(|err| err.to_string())?;
        let file_len = file.metadata().map_err(|err| err.to_string())?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| "file too short for a netcdf header".to_string())?;
        if &magic[..3] != b"CDF" {
            return Err("not a netcdf classic file (CDF-1/CDF-2)".to_string());
        }
        let version = magic[3];
        if version != 1 && version != 2 {
            return Err(format!("unsupported netcdf variant byte {version:#04x}"));
        }

        let numrecs_raw = read_u32(&mut reader)?;

        let mut dimensions = Vec::new();
        for _ in 0..read_tagged_count(&mut reader, TAG_DIMENSION, "dimension")? {
            let name = read_name(&mut reader)?;
            let len = read_u32(&mut reader)? as usize;
            dimensions.push(Dimension {
                name,
                len,
                unlimited: len == 0,
            });
        }
        if dimensions.iter().filter(|dim| dim.unlimited).count() > 1 {
            return Err("more than one unlimited dimension".to_string());
        }

        let mut attributes = Vec::new();
        for _ in 0..read_tagged_count(&mut reader, TAG_ATTRIBUTE, "attribute")? {
            attributes.push(read_attribute(&mut reader)?);
        }

        let mut variables = Vec::new();
        for _ in 0..read_tagged_count(&mut reader, TAG_VARIABLE, "variable")? {
            let name = read_name(&mut reader)?;
            let rank = read_u32(&mut reader)? as usize;
            let mut dim_ids = Vec::with_capacity(rank);
            for _ in 0..rank {
                let dim_id = read_u32(&mut reader)? as usize;
                if dim_id >= dimensions.len() {
                    return Err(format!("variable {name} references unknown dimension"));
                }
                dim_ids.push(dim_id);
            }
            for (pos, dim_id) in dim_ids.iter().enumerate() {
                if dimensions[*dim_id].unlimited && pos != 0 {
                    return Err(format!(
                        "variable {name} has the unlimited dimension in a non-leading position"
                    ));
                }
            }
            let mut var_attributes = Vec::new();
            for _ in 0..read_tagged_count(&mut reader, TAG_ATTRIBUTE, "attribute")? {
                var_attributes.push(read_attribute(&mut reader)?);
            }
            let type_code = read_u32(&mut reader)?;
            let nc_type = NcType::from_code(type_code)
                .ok_or_else(|| format!("variable {name} has unknown type code {type_code}"))?;
            let _vsize = read_u32(&mut reader)?;
            let begin = if version == 1 {
                read_u32(&mut reader)? as u64
            } else {
                read_u64(&mut reader)?
            };
            variables.push(VarMeta {
                name,
                dim_ids,
                attributes: var_attributes,
                nc_type,
                begin,
            });
        }

        let mut nc = Self {
            path: path.display().to_string(),
            reader,
            version,
            num_records: 0,
            dimensions,
            attributes,
            variables,
            recsize: 0,
        };

        let record_ids: Vec<usize> = (0..nc.variables.len())
            .filter(|idx| nc.is_record(*idx))
            .collect();
        let single_record_var = record_ids.len() == 1;
        for idx in &record_ids {
            let slab = (nc.per_record_elements(*idx) * nc.variables[*idx].nc_type.size()) as u64;
            nc.recsize += if single_record_var { slab } else { round4(slab) };
        }

        nc.num_records = if numrecs_raw == STREAMING {
            let first_begin = record_ids
                .iter()
                .map(|idx| nc.variables[*idx].begin)
                .min()
                .unwrap_or(file_len);
            if nc.recsize == 0 {
                0
            } else {
                ((file_len.saturating_sub(first_begin)) / nc.recsize) as usize
            }
        } else {
            numrecs_raw as usize
        };

        Ok(nc)
    }

    fn fail(&self, message: impl Into<String>) -> TellusError {
        TellusError::Dataset {
            path: self.path.clone(),
            message: message.into(),
        }
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|var| var.name == name)
    }

    fn is_record(&self, idx: usize) -> bool {
        self.variables[idx]
            .dim_ids
            .first()
            .map(|dim_id| self.dimensions[*dim_id].unlimited)
            .unwrap_or(false)
    }

    fn per_record_elements(&self, idx: usize) -> usize {
        self.variables[idx]
            .dim_ids
            .iter()
            .skip(1)
            .map(|dim_id| self.dimensions[*dim_id].len)
            .product()
    }

    pub fn shape(&self, idx: usize) -> Vec<usize> {
        self.variables[idx]
            .dim_ids
            .iter()
            .map(|dim_id| {
                let dim = &self.dimensions[*dim_id];
                if dim.unlimited { self.num_records } else { dim.len }
            })
            .collect()
    }

    pub fn element_count(&self, idx: usize) -> usize {
        self.shape(idx).iter().product()
    }

    /// `_FillValue`, falling back to `missing_value`.
    pub fn fill_value(&self, idx: usize) -> Option<f64> {
        let var = &self.variables[idx];
        var.attr("_FillValue")
            .or_else(|| var.attr("missing_value"))
            .and_then(AttrValue::first_number)
    }

    /// All elements decoded to f64, record slabs stitched in time order.
    /// No scale/offset is applied; packed values come back raw.
    pub fn read_values(&mut self, idx: usize) -> Result<Vec<f64>, TellusError> {
        let nc_type = self.variables[idx].nc_type;
        if nc_type == NcType::Char {
            return Err(self.fail(format!(
                "variable {} holds text, not numeric data",
                self.variables[idx].name
            )));
        }
        let mut values = Vec::with_capacity(self.element_count(idx));
        self.for_each_slab(idx, |bytes| {
            decode_values(bytes, nc_type, &mut values);
            Ok(())
        })?;
        Ok(values)
    }

    pub fn read_text(&mut self, idx: usize) -> Result<Vec<u8>, TellusError> {
        let mut bytes = Vec::with_capacity(self.element_count(idx));
        self.for_each_slab(idx, |slab| {
            bytes.extend_from_slice(slab);
            Ok(())
        })?;
        Ok(bytes)
    }

    /// `(valid, total)` where valid excludes NaN and the fill value.
    /// Streams the variable; nothing is materialized.
    pub fn valid_count(&mut self, idx: usize) -> Result<(usize, usize), TellusError> {
        let nc_type = self.variables[idx].nc_type;
        if nc_type == NcType::Char {
            return Ok((0, 0));
        }
        let fill = self.fill_value(idx);
        let mut valid = 0usize;
        let mut total = 0usize;
        self.for_each_slab(idx, |bytes| {
            let (v, t) = count_valid(bytes, nc_type, fill);
            valid += v;
            total += t;
            Ok(())
        })?;
        Ok((valid, total))
    }

    fn for_each_slab<F>(&mut self, idx: usize, mut visit: F) -> Result<(), TellusError>
    where
        F: FnMut(&[u8]) -> Result<(), TellusError>,
    {
        let type_size = self.variables[idx].nc_type.size();
        let begin = self.variables[idx].begin;
        if self.is_record(idx) {
            let slab_len = self.per_record_elements(idx) * type_size;
            let mut slab = vec![0u8; slab_len];
            for record in 0..self.num_records {
                let offset = begin + record as u64 * self.recsize;
                self.reader
                    .seek(SeekFrom::Start(offset))
                    .map_err(|err| self.fail(err.to_string()))?;
                self.reader
                    .read_exact(&mut slab)
                    .map_err(|_| self.fail("record data truncated"))?;
                visit(&slab)?;
            }
        } else {
            let total_bytes = self.element_count(idx) * type_size;
            self.reader
                .seek(SeekFrom::Start(begin))
                .map_err(|err| self.fail(err.to_string()))?;
            let chunk_bytes = 1 << 20;
            let mut remaining = total_bytes;
            let mut buf = vec![0u8; chunk_bytes.min(total_bytes.max(1))];
            while remaining > 0 {
                let take = remaining.min(chunk_bytes);
                let take = take - take % type_size;
                self.reader
                    .read_exact(&mut buf[..take])
                    .map_err(|_| self.fail("variable data truncated"))?;
                visit(&buf[..take])?;
                remaining -= take;
            }
        }
        Ok(())
    }

    /// Full in-memory copy, the merge stage's working form.
    pub fn to_model(&mut self) -> Result<NcModel, TellusError> {
        let mut variables = Vec::with_capacity(self.variables.len());
        for idx in 0..self.variables.len() {
            let meta = self.variables[idx].clone();
            let data = if meta.nc_type == NcType::Char {
                VarData::Text(self.read_text(idx)?)
            } else {
                VarData::Numeric(self.read_values(idx)?)
            };
            variables.push(ModelVar {
                name: meta.name,
                dims: meta.dim_ids,
                attributes: meta.attributes,
                nc_type: meta.nc_type,
                data,
            });
        }
        Ok(NcModel {
            dimensions: self.dimensions.clone(),
            attributes: self.attributes.clone(),
            variables,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VarData {
    Numeric(Vec<f64>),
    Text(Vec<u8>),
}

impl VarData {
    pub fn len(&self) -> usize {
        match self {
            VarData::Numeric(values) => values.len(),
            VarData::Text(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ModelVar {
    pub name: String,
    pub dims: Vec<usize>,
    pub attributes: Vec<Attribute>,
    pub nc_type: NcType,
    pub data: VarData,
}

/// In-memory file for the writer: dimensions, global attributes, variables
/// with their full data. Record count is derived from the data lengths.
#[derive(Debug, Clone, Default)]
pub struct NcModel {
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub variables: Vec<ModelVar>,
}

impl NcModel {
    pub fn variable(&self, name: &str) -> Option<&ModelVar> {
        self.variables.iter().find(|var| var.name == name)
    }

    pub fn variable_mut(&mut self, name: &str) -> Option<&mut ModelVar> {
        self.variables.iter_mut().find(|var| var.name == name)
    }

    /// Elements per record, counting every dimension after the leading one.
    pub fn per_record_elements(&self, var: &ModelVar) -> usize {
        var.dims
            .iter()
            .skip(1)
            .map(|dim_id| self.dimensions[*dim_id].len)
            .product()
    }

    pub fn is_record(&self, var: &ModelVar) -> bool {
        var.dims
            .first()
            .map(|dim_id| self.dimensions[*dim_id].unlimited)
            .unwrap_or(false)
    }

    fn derive_num_records(&self) -> Result<usize, String> {
        let mut derived: Option<usize> = None;
        for var in &self.variables {
            if !self.is_record(var) {
                continue;
            }
            let per = self.per_record_elements(var);
            if per == 0 {
                return Err(format!("record variable {} spans a zero-length dimension", var.name));
            }
            if var.data.len() % per != 0 {
                return Err(format!(
                    "record variable {} data length {} is not a whole number of records",
                    var.name,
                    var.data.len()
                ));
            }
            let records = var.data.len() / per;
            match derived {
                None => derived = Some(records),
                Some(existing) if existing != records => {
                    return Err(format!(
                        "record variable {} has {records} records, expected {existing}",
                        var.name
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(derived.unwrap_or(0))
    }

    fn validate(&self) -> Result<(), String> {
        if self.dimensions.iter().filter(|dim| dim.unlimited).count() > 1 {
            return Err("more than one unlimited dimension".to_string());
        }
        for var in &self.variables {
            for (pos, dim_id) in var.dims.iter().enumerate() {
                let dim = self
                    .dimensions
                    .get(*dim_id)
                    .ok_or_else(|| format!("variable {} references unknown dimension", var.name))?;
                if dim.unlimited && pos != 0 {
                    return Err(format!(
                        "variable {} has the unlimited dimension in a non-leading position",
                        var.name
                    ));
                }
            }
            let is_text = matches!(var.data, VarData::Text(_));
            if is_text != (var.nc_type == NcType::Char) {
                return Err(format!("variable {} data does not match its type", var.name));
            }
            if !self.is_record(var) {
                let expected: usize = var
                    .dims
                    .iter()
                    .map(|dim_id| self.dimensions[*dim_id].len)
                    .product();
                if var.data.len() != expected {
                    return Err(format!(
                        "variable {} holds {} elements, expected {expected}",
                        var.name,
                        var.data.len()
                    ));
                }
            }
        }
        self.derive_num_records().map(|_| ())
    }
}

/// Serialize and atomically place a classic-format file. CDF-2 offsets are
/// used only when the payload outgrows CDF-1.
pub fn write_classic(path: &Path, model: &NcModel) -> Result<(), TellusError> {
    let bytes = encode(model).map_err(|message| TellusError::Dataset {
        path: path.display().to_string(),
        message,
    })?;
    let parent = path
        .parent()
        .ok_or_else(|| TellusError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| TellusError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("tellus-cm-nc")
        .tempfile_in(parent)
        .map_err(|err| TellusError::Filesystem(err.to_string()))?;
    temp.write_all(&bytes)
        .map_err(|err| TellusError::Filesystem(err.to_string()))?;
    if path.exists() {
        fs::remove_file(path).map_err(|err| TellusError::Filesystem(err.to_string()))?;
    }
    temp.persist(path)
        .map_err(|err| TellusError::Filesystem(err.to_string()))?;
    Ok(())
}

fn encode(model: &NcModel) -> Result<Vec<u8>, String> {
    model.validate()?;
    let num_records = model.derive_num_records()?;

    let record_count = model.variables.iter().filter(|v| model.is_record(v)).count();
    let single_record_var = record_count == 1;

    // Allocated byte span per variable: fixed data padded to 4, record slabs
    // padded unless the file has exactly one record variable.
    let alloc = |var: &ModelVar| -> u64 {
        let type_size = var.nc_type.size() as u64;
        if model.is_record(var) {
            let slab = model.per_record_elements(var) as u64 * type_size;
            if single_record_var { slab } else { round4(slab) }
        } else {
            let total: usize = var
                .dims
                .iter()
                .map(|dim_id| model.dimensions[*dim_id].len)
                .product();
            round4(total as u64 * type_size)
        }
    };

    let fixed_total: u64 = model
        .variables
        .iter()
        .filter(|var| !model.is_record(var))
        .map(alloc)
        .sum();
    let recsize: u64 = model
        .variables
        .iter()
        .filter(|var| model.is_record(var))
        .map(alloc)
        .sum();
    let data_total = fixed_total + recsize * num_records as u64;

    let zero_begins = vec![0u64; model.variables.len()];
    let narrow_header = header_bytes(model, num_records, &zero_begins, false);
    let wide = narrow_header.len() as u64 + data_total > u32::MAX as u64;
    let header_len = if wide {
        header_bytes(model, num_records, &zero_begins, true).len() as u64
    } else {
        narrow_header.len() as u64
    };

    let mut begins = Vec::with_capacity(model.variables.len());
    let mut cursor = header_len;
    for var in &model.variables {
        if model.is_record(var) {
            begins.push(0);
        } else {
            begins.push(cursor);
            cursor += alloc(var);
        }
    }
    for (idx, var) in model.variables.iter().enumerate() {
        if model.is_record(var) {
            begins[idx] = cursor;
            cursor += alloc(var);
        }
    }

    let mut out = header_bytes(model, num_records, &begins, wide);

    for var in model.variables.iter().filter(|var| !model.is_record(var)) {
        let start = out.len();
        encode_data(&mut out, var, 0, var.data.len());
        let padded = round4((out.len() - start) as u64) as usize + start;
        pad_to(&mut out, padded);
    }
    for record in 0..num_records {
        for var in model.variables.iter().filter(|var| model.is_record(var)) {
            let per = model.per_record_elements(var);
            let start = out.len();
            encode_data(&mut out, var, record * per, per);
            if !single_record_var {
                let padded = round4((out.len() - start) as u64) as usize + start;
                pad_to(&mut out, padded);
            }
        }
    }
    Ok(out)
}

fn header_bytes(model: &NcModel, num_records: usize, begins: &[u64], wide: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"CDF");
    out.push(if wide { 2 } else { 1 });
    put_u32(&mut out, num_records as u32);

    put_tagged_count(&mut out, TAG_DIMENSION, model.dimensions.len());
    for dim in &model.dimensions {
        put_name(&mut out, &dim.name);
        put_u32(&mut out, if dim.unlimited { 0 } else { dim.len as u32 });
    }

    put_attr_list(&mut out, &model.attributes);

    put_tagged_count(&mut out, TAG_VARIABLE, model.variables.len());
    for (idx, var) in model.variables.iter().enumerate() {
        put_name(&mut out, &var.name);
        put_u32(&mut out, var.dims.len() as u32);
        for dim_id in &var.dims {
            put_u32(&mut out, *dim_id as u32);
        }
        put_attr_list(&mut out, &var.attributes);
        put_u32(&mut out, var.nc_type.code());

        let type_size = var.nc_type.size() as u64;
        let vsize = if model.is_record(var) {
            round4(model.per_record_elements(var) as u64 * type_size)
        } else {
            let total: usize = var
                .dims
                .iter()
                .map(|dim_id| model.dimensions[*dim_id].len)
                .product();
            round4(total as u64 * type_size)
        };
        put_u32(&mut out, vsize.min(u32::MAX as u64) as u32);

        if wide {
            out.extend_from_slice(&begins[idx].to_be_bytes());
        } else {
            put_u32(&mut out, begins[idx] as u32);
        }
    }
    out
}

fn put_attr_list(out: &mut Vec<u8>, attributes: &[Attribute]) {
    put_tagged_count(out, TAG_ATTRIBUTE, attributes.len());
    for attr in attributes {
        put_name(out, &attr.name);
        match &attr.value {
            AttrValue::Text(text) => {
                put_u32(out, NcType::Char.code());
                put_u32(out, text.len() as u32);
                out.extend_from_slice(text.as_bytes());
                pad_to(out, round4(out.len() as u64) as usize);
            }
            AttrValue::Bytes(values) => {
                put_u32(out, NcType::Byte.code());
                put_u32(out, values.len() as u32);
                out.extend_from_slice(values);
                pad_to(out, round4(out.len() as u64) as usize);
            }
            AttrValue::Shorts(values) => {
                put_u32(out, NcType::Short.code());
                put_u32(out, values.len() as u32);
                for value in values {
                    out.extend_from_slice(&value.to_be_bytes());
                }
                pad_to(out, round4(out.len() as u64) as usize);
            }
            AttrValue::Ints(values) => {
                put_u32(out, NcType::Int.code());
                put_u32(out, values.len() as u32);
                for value in values {
                    out.extend_from_slice(&value.to_be_bytes());
                }
            }
            AttrValue::Floats(values) => {
                put_u32(out, NcType::Float.code());
                put_u32(out, values.len() as u32);
                for value in values {
                    out.extend_from_slice(&value.to_be_bytes());
                }
            }
            AttrValue::Doubles(values) => {
                put_u32(out, NcType::Double.code());
                put_u32(out, values.len() as u32);
                for value in values {
                    out.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
    }
}

fn encode_data(out: &mut Vec<u8>, var: &ModelVar, offset: usize, count: usize) {
    match &var.data {
        VarData::Text(bytes) => out.extend_from_slice(&bytes[offset..offset + count]),
        VarData::Numeric(values) => {
            for value in &values[offset..offset + count] {
                match var.nc_type {
                    NcType::Byte => out.push(*value as i8 as u8),
                    NcType::Char => {}
                    NcType::Short => out.extend_from_slice(&(*value as i16).to_be_bytes()),
                    NcType::Int => out.extend_from_slice(&(*value as i32).to_be_bytes()),
                    NcType::Float => out.extend_from_slice(&(*value as f32).to_be_bytes()),
                    NcType::Double => out.extend_from_slice(&value.to_be_bytes()),
                }
            }
        }
    }
}

fn decode_values(bytes: &[u8], nc_type: NcType, out: &mut Vec<f64>) {
    let size = nc_type.size();
    for chunk in bytes.chunks_exact(size) {
        out.push(decode_one(chunk, nc_type));
    }
}

fn count_valid(bytes: &[u8], nc_type: NcType, fill: Option<f64>) -> (usize, usize) {
    let size = nc_type.size();
    let mut valid = 0usize;
    let mut total = 0usize;
    for chunk in bytes.chunks_exact(size) {
        let value = decode_one(chunk, nc_type);
        total += 1;
        let filled = fill.map(|f| value == f).unwrap_or(false);
        if !value.is_nan() && !filled {
            valid += 1;
        }
    }
    (valid, total)
}

fn decode_one(chunk: &[u8], nc_type: NcType) -> f64 {
    match nc_type {
        NcType::Byte | NcType::Char => chunk[0] as i8 as f64,
        NcType::Short => i16::from_be_bytes([chunk[0], chunk[1]]) as f64,
        NcType::Int => i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
        NcType::Float => f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
        NcType::Double => f64::from_be_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]),
    }
}

fn round4(n: u64) -> u64 {
    (n + 3) & !3
}

fn pad_to(out: &mut Vec<u8>, target: usize) {
    while out.len() < target {
        out.push(0);
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    put_u32(out, name.len() as u32);
    out.extend_from_slice(name.as_bytes());
    pad_to(out, round4(out.len() as u64) as usize);
}

fn put_tagged_count(out: &mut Vec<u8>, tag: u32, count: usize) {
    if count == 0 {
        put_u32(out, 0);
        put_u32(out, 0);
    } else {
        put_u32(out, tag);
        put_u32(out, count as u32);
    }
}

fn read_u32(reader: &mut BufReader<File>) -> Result<u32, String> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| "header truncated".to_string())?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(reader: &mut BufReader<File>) -> Result<u64, String> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| "header truncated".to_string())?;
    Ok(u64::from_be_bytes(buf))
}

fn read_vec(reader: &mut BufReader<File>, len: usize) -> Result<Vec<u8>, String> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|_| "header truncated".to_string())?;
    Ok(buf)
}

fn skip_padding(reader: &mut BufReader<File>, len: usize) -> Result<(), String> {
    let pad = (4 - len % 4) % 4;
    if pad > 0 {
        read_vec(reader, pad)?;
    }
    Ok(())
}

fn read_name(reader: &mut BufReader<File>) -> Result<String, String> {
    let len = read_u32(reader)? as usize;
    let bytes = read_vec(reader, len)?;
    skip_padding(reader, len)?;
    String::from_utf8(bytes).map_err(|_| "name is not valid utf-8".to_string())
}

fn read_attribute(reader: &mut BufReader<File>) -> Result<Attribute, String> {
    let name = read_name(reader)?;
    let type_code = read_u32(reader)?;
    let nc_type = NcType::from_code(type_code)
        .ok_or_else(|| format!("attribute {name} has unknown type code {type_code}"))?;
    let count = read_u32(reader)? as usize;
    let value = match nc_type {
        NcType::Char => {
            let bytes = read_vec(reader, count)?;
            skip_padding(reader, count)?;
            AttrValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        NcType::Byte => {
            let bytes = read_vec(reader, count)?;
            skip_padding(reader, count)?;
            AttrValue::Bytes(bytes)
        }
        NcType::Short => {
            let bytes = read_vec(reader, count * 2)?;
            skip_padding(reader, count * 2)?;
            AttrValue::Shorts(
                bytes
                    .chunks_exact(2)
                    .map(|chunk| i16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect(),
            )
        }
        NcType::Int => {
            let bytes = read_vec(reader, count * 4)?;
            AttrValue::Ints(
                bytes
                    .chunks_exact(4)
                    .map(|chunk| i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect(),
            )
        }
        NcType::Float => {
            let bytes = read_vec(reader, count * 4)?;
            AttrValue::Floats(
                bytes
                    .chunks_exact(4)
                    .map(|chunk| f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect(),
            )
        }
        NcType::Double => {
            let bytes = read_vec(reader, count * 8)?;
            AttrValue::Doubles(
                bytes
                    .chunks_exact(8)
                    .map(|chunk| {
                        f64::from_be_bytes([
                            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6],
                            chunk[7],
                        ])
                    })
                    .collect(),
            )
        }
    };
    Ok(Attribute { name, value })
}

fn read_tagged_count(
    reader: &mut BufReader<File>,
    expected: u32,
    label: &str,
) -> Result<usize, String> {
    let tag = read_u32(reader)?;
    let count = read_u32(reader)? as usize;
    if count == 0 && (tag == 0 || tag == expected) {
        return Ok(0);
    }
    if tag != expected {
        return Err(format!("malformed {label} list (tag {tag:#x})"));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn grid_model(times: &[f64], temps: &[f64]) -> NcModel {
        NcModel {
            dimensions: vec![
                Dimension::unlimited("time"),
                Dimension::fixed("latitude", 2),
                Dimension::fixed("longitude", 3),
            ],
            attributes: vec![Attribute::text("Conventions", "CF-1.6")],
            variables: vec![
                ModelVar {
                    name: "time".to_string(),
                    dims: vec![0],
                    attributes: vec![Attribute::text("units", "hours since 1900-01-01 00:00:00.0")],
                    nc_type: NcType::Int,
                    data: VarData::Numeric(times.to_vec()),
                },
                ModelVar {
                    name: "latitude".to_string(),
                    dims: vec![1],
                    attributes: vec![Attribute::text("units", "degrees_north")],
                    nc_type: NcType::Double,
                    data: VarData::Numeric(vec![60.0, 10.0]),
                },
                ModelVar {
                    name: "longitude".to_string(),
                    dims: vec![2],
                    attributes: vec![Attribute::text("units", "degrees_east")],
                    nc_type: NcType::Double,
                    data: VarData::Numeric(vec![70.0, 105.0, 140.0]),
                },
                ModelVar {
                    name: "t2m".to_string(),
                    dims: vec![0, 1, 2],
                    attributes: vec![
                        Attribute::text("units", "K"),
                        Attribute::double("_FillValue", -32767.0),
                    ],
                    nc_type: NcType::Float,
                    data: VarData::Numeric(temps.to_vec()),
                },
            ],
        }
    }

    #[test]
    fn round_trip_grid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.nc");
        let times = [0.0, 1.0];
        let temps: Vec<f64> = (0..12).map(|i| 270.0 + i as f64).collect();
        write_classic(&path, &grid_model(&times, &temps)).unwrap();

        let mut nc = NcReader::open(&path).unwrap();
        assert_eq!(nc.version, 1);
        assert_eq!(nc.num_records, 2);
        assert_eq!(nc.dimensions.len(), 3);

        let t2m = nc.find("t2m").unwrap();
        assert_eq!(nc.shape(t2m), vec![2, 2, 3]);
        assert_eq!(nc.read_values(t2m).unwrap(), temps);
        assert_eq!(nc.fill_value(t2m), Some(-32767.0));

        let time = nc.find("time").unwrap();
        assert_eq!(nc.read_values(time).unwrap(), times);
        assert_eq!(
            nc.variables[time].attr("units").and_then(AttrValue::as_text),
            Some("hours since 1900-01-01 00:00:00.0")
        );

        let model = nc.to_model().unwrap();
        assert_eq!(model.variables.len(), 4);
        assert_eq!(model.attributes, vec![Attribute::text("Conventions", "CF-1.6")]);
    }

    #[test]
    fn valid_count_excludes_fill_and_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fills.nc");
        let mut temps: Vec<f64> = (0..12).map(|i| 270.0 + i as f64).collect();
        temps[0] = -32767.0;
        temps[5] = -32767.0;
        temps[7] = f64::NAN;
        write_classic(&path, &grid_model(&[0.0, 1.0], &temps)).unwrap();

        let mut nc = NcReader::open(&path).unwrap();
        let t2m = nc.find("t2m").unwrap();
        assert_eq!(nc.valid_count(t2m).unwrap(), (9, 12));
    }

    #[test]
    fn single_record_variable_is_unpadded() {
        // One record variable with a 2-byte slab: records must be packed
        // back to back with no alignment gap.
        let model = NcModel {
            dimensions: vec![Dimension::unlimited("time")],
            attributes: Vec::new(),
            variables: vec![ModelVar {
                name: "level".to_string(),
                dims: vec![0],
                attributes: Vec::new(),
                nc_type: NcType::Short,
                data: VarData::Numeric(vec![1.0, 2.0, 3.0]),
            }],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packed.nc");
        write_classic(&path, &model).unwrap();

        let mut nc = NcReader::open(&path).unwrap();
        assert_eq!(nc.num_records, 3);
        let idx = nc.find("level").unwrap();
        assert_eq!(nc.read_values(idx).unwrap(), vec![1.0, 2.0, 3.0]);

        let written = fs::read(&path).unwrap();
        assert_eq!(written.len() % 4, 2);
    }

    #[test]
    fn sibling_record_variables_are_padded() {
        let model = NcModel {
            dimensions: vec![Dimension::unlimited("time")],
            attributes: Vec::new(),
            variables: vec![
                ModelVar {
                    name: "a".to_string(),
                    dims: vec![0],
                    attributes: Vec::new(),
                    nc_type: NcType::Short,
                    data: VarData::Numeric(vec![1.0, 2.0]),
                },
                ModelVar {
                    name: "b".to_string(),
                    dims: vec![0],
                    attributes: Vec::new(),
                    nc_type: NcType::Short,
                    data: VarData::Numeric(vec![10.0, 20.0]),
                },
            ],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("siblings.nc");
        write_classic(&path, &model).unwrap();

        let mut nc = NcReader::open(&path).unwrap();
        assert_eq!(nc.num_records, 2);
        assert_eq!(nc.read_values(0).unwrap(), vec![1.0, 2.0]);
        assert_eq!(nc.read_values(1).unwrap(), vec![10.0, 20.0]);
    }

    #[test]
    fn rejects_non_classic_files() {
        let dir = tempfile::tempdir().unwrap();

        let hdf5 = dir.path().join("modern.nc");
        fs::write(&hdf5, b"\x89HDF\r\n\x1a\nrest-of-superblock").unwrap();
        assert_matches!(NcReader::open(&hdf5), Err(TellusError::Dataset { .. }));

        let truncated = dir.path().join("short.nc");
        fs::write(&truncated, b"CD").unwrap();
        assert_matches!(NcReader::open(&truncated), Err(TellusError::Dataset { .. }));

        let bad_version = dir.path().join("cdf5.nc");
        fs::write(&bad_version, b"CDF\x05\x00\x00\x00\x00").unwrap();
        assert_matches!(NcReader::open(&bad_version), Err(TellusError::Dataset { .. }));
    }

    #[test]
    fn record_mismatch_is_rejected_by_writer() {
        let mut model = grid_model(&[0.0, 1.0], &(0..12).map(|i| i as f64).collect::<Vec<_>>());
        // three time stamps against two records of data
        model.variable_mut("time").unwrap().data = VarData::Numeric(vec![0.0, 1.0, 2.0]);
        let dir = tempfile::tempdir().unwrap();
        let err = write_classic(&dir.path().join("bad.nc"), &model).unwrap_err();
        assert_matches!(err, TellusError::Dataset { .. });
    }
}
