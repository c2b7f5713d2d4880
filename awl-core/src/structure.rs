//! Struct field layout
//!
//! Fields are laid out in declaration order. BOOLs pack into the byte of a
//! preceding BOOL, everything wider than a byte lands on an even byte.
//! Compound fields (UDTs, inline STRUCTs, multi-instances) contribute a
//! parent field plus flattened children named `parent.child`.

use crate::constants::MAX_BYTE_OFFSET;
use crate::datatypes::{DataType, FieldDecl};
use crate::memory::{Memory, Value};
use crate::offset::Offset;
use crate::sysblocks::sfb_instance_sections;
use awl_common::{AwlError, AwlResult};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructError {
    #[error("Recursive type definition: {0}")]
    Recursion(String),

    #[error("UDT {0} is referenced but not defined")]
    UnknownUdt(u16),

    #[error("FB {0} is used as multi-instance but not defined")]
    UnknownFb(u16),

    #[error("SFB {0} does not exist")]
    UnknownSfb(u16),

    #[error("Multi-instance field '{0}' has zero size")]
    ZeroSizeMultiInstance(String),

    #[error("Ambiguous field name '{0}'")]
    Ambiguous(String),

    #[error("Field '{0}' exceeds the maximum byte offset {max}", max = MAX_BYTE_OFFSET)]
    OffsetOverflow(String),

    #[error("{0}")]
    Invalid(String),
}

impl From<StructError> for AwlError {
    fn from(err: StructError) -> Self {
        AwlError::compile(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub offset: Offset,
    pub data_type: DataType,
    pub bit_size: u32,
    pub init: Option<Value>,
}

impl StructField {
    /// Number of bytes this field occupies (a BOOL counts as one)
    pub fn byte_size(&self) -> u32 {
        self.bit_size.div_ceil(8).max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Struct {
    fields: Vec<StructField>,
    name_map: HashMap<String, usize>,
    size: u32,
}

impl Struct {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.name_map.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.name_map.get(name).copied()
    }

    fn insert(&mut self, field: StructField) -> Result<&StructField, StructError> {
        if self.name_map.contains_key(&field.name) {
            return Err(StructError::Ambiguous(field.name));
        }
        let end = field
            .offset
            .byte
            .checked_add(field.byte_size())
            .filter(|end| *end <= MAX_BYTE_OFFSET + 1)
            .ok_or_else(|| StructError::OffsetOverflow(field.name.clone()))?;
        self.size = self.size.max(end);
        self.name_map.insert(field.name.clone(), self.fields.len());
        self.fields.push(field);
        Ok(&self.fields[self.fields.len() - 1])
    }

    /// Append a field at the current end. A 1-bit field packs into the byte
    /// of a directly preceding 1-bit field while bits are left.
    pub fn add_field(
        &mut self,
        name: &str,
        data_type: DataType,
        bit_size: u32,
        init: Option<Value>,
    ) -> Result<&StructField, StructError> {
        let offset = match self.fields.last() {
            Some(prev)
                if bit_size == 1
                    && prev.bit_size == 1
                    && prev.offset.bit < 7
                    && prev.offset.byte + 1 == self.size =>
            {
                prev.offset.add_bits(1)
            }
            _ => Offset::byte(self.size),
        };
        self.insert(StructField {
            name: name.to_string(),
            offset,
            data_type,
            bit_size,
            init,
        })
    }

    /// Pad with bytes to a multiple of `byte_align`, then append
    pub fn add_field_aligned(
        &mut self,
        name: &str,
        data_type: DataType,
        bit_size: u32,
        byte_align: u32,
        init: Option<Value>,
    ) -> Result<&StructField, StructError> {
        self.pad_to(byte_align);
        self.add_field(name, data_type, bit_size, init)
    }

    pub fn add_field_naturally_aligned(
        &mut self,
        name: &str,
        data_type: DataType,
        bit_size: u32,
        init: Option<Value>,
    ) -> Result<&StructField, StructError> {
        let align = if bit_size > 8 { 2 } else { 1 };
        self.add_field_aligned(name, data_type, bit_size, align, init)
    }

    pub fn pad_to(&mut self, byte_align: u32) {
        if byte_align > 1 && self.size % byte_align != 0 {
            self.size += byte_align - self.size % byte_align;
        }
    }

    /// Copy the fields of `sub` under `parent`, shifted by `base`
    fn merge_children(&mut self, parent: &str, base: Offset, sub: &Struct) -> Result<(), StructError> {
        for child in &sub.fields {
            let mut field = child.clone();
            field.name = format!("{}.{}", parent, child.name);
            field.offset = base + child.offset;
            self.insert(field)?;
        }
        Ok(())
    }

    /// Offset and bit size of one element of an ARRAY field
    pub fn array_element(&self, name: &str, indices: &[i32]) -> AwlResult<(Offset, u32, DataType)> {
        let field = self
            .field(name)
            .ok_or_else(|| AwlError::compile(format!("Field '{}' not found", name)))?;
        let DataType::Array { dims, element } = &field.data_type else {
            return Err(AwlError::compile(format!("Field '{}' is not an ARRAY", name)));
        };
        if dims.len() != indices.len() {
            return Err(AwlError::compile(format!(
                "ARRAY '{}' has {} dimensions, got {} indices",
                name,
                dims.len(),
                indices.len()
            )));
        }
        let mut linear: u64 = 0;
        for ((lo, hi), idx) in dims.iter().zip(indices) {
            if idx < lo || idx > hi {
                return Err(AwlError::compile(format!(
                    "ARRAY index {} out of range {}..{} in '{}'",
                    idx, lo, hi, name
                )));
            }
            let span = (i64::from(*hi) - i64::from(*lo) + 1) as u64;
            linear = linear * span + (i64::from(*idx) - i64::from(*lo)) as u64;
        }
        let elem_bits = element_bit_size(element)
            .ok_or_else(|| AwlError::compile(format!("ARRAY '{}' has no scalar elements", name)))?;
        let offset = if elem_bits == 1 {
            field.offset.add_bits(linear)
        } else {
            field.offset.add_bytes((linear * u64::from(elem_bits / 8)) as u32)
        };
        Ok((offset, elem_bits, (**element).clone()))
    }

    /// Memory image with every field's initial value applied
    pub fn init_image(&self) -> AwlResult<Memory> {
        let mut mem = Memory::new(self.size as usize);
        for field in &self.fields {
            if let Some(init) = &field.init {
                mem.store(field.offset, init)?;
            }
        }
        Ok(mem)
    }
}

fn element_bit_size(element: &DataType) -> Option<u32> {
    match element.width() {
        Some(1) => Some(1),
        Some(w) => Some(w.div_ceil(8) * 8),
        None => None,
    }
}

/// Key for compound types that are built once and may recurse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Udt(u16),
    Fb(u16),
    Sfb(u16),
}

/// Where a builder finds the declarations of named types
pub trait TypeSource {
    fn udt_fields(&self, index: u16) -> Option<&[FieldDecl]>;

    /// The IN, OUT, INOUT and STAT sections of an FB, in that order
    fn fb_sections(&self, index: u16) -> Option<Vec<&[FieldDecl]>>;
}

/// Builds struct layouts with a DFS over UDT and FB references
pub struct LayoutBuilder<'a, S: TypeSource> {
    source: &'a S,
    visiting: HashSet<TypeKey>,
    path: Vec<TypeKey>,
    built: HashMap<TypeKey, Rc<Struct>>,
}

impl<'a, S: TypeSource> LayoutBuilder<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            visiting: HashSet::new(),
            path: Vec::new(),
            built: HashMap::new(),
        }
    }

    pub fn build_udt(&mut self, index: u16) -> Result<Rc<Struct>, StructError> {
        self.build_type(TypeKey::Udt(index))
    }

    pub fn build_fb(&mut self, index: u16) -> Result<Rc<Struct>, StructError> {
        self.build_type(TypeKey::Fb(index))
    }

    pub fn build_sfb(&mut self, index: u16) -> Result<Rc<Struct>, StructError> {
        self.build_type(TypeKey::Sfb(index))
    }

    pub fn build_type(&mut self, key: TypeKey) -> Result<Rc<Struct>, StructError> {
        if let Some(done) = self.built.get(&key) {
            return Ok(Rc::clone(done));
        }
        if !self.visiting.insert(key) {
            let chain: Vec<String> = self
                .path
                .iter()
                .chain(std::iter::once(&key))
                .map(|k| match k {
                    TypeKey::Udt(i) => format!("UDT {}", i),
                    TypeKey::Fb(i) => format!("FB {}", i),
                    TypeKey::Sfb(i) => format!("SFB {}", i),
                })
                .collect();
            return Err(StructError::Recursion(chain.join(" -> ")));
        }
        self.path.push(key);
        let source = self.source;
        let result = match key {
            TypeKey::Udt(index) => match source.udt_fields(index) {
                Some(fields) => self.build_fields(fields),
                None => Err(StructError::UnknownUdt(index)),
            },
            TypeKey::Fb(index) => match source.fb_sections(index) {
                Some(sections) => self.build_sections(&sections),
                None => Err(StructError::UnknownFb(index)),
            },
            TypeKey::Sfb(index) => match sfb_instance_sections(index) {
                Some(Ok(sections)) => {
                    let sections: Vec<&[FieldDecl]> = sections.iter().map(|s| s.as_slice()).collect();
                    self.build_sections(&sections)
                }
                Some(Err(e)) => Err(StructError::Invalid(e.message())),
                None => Err(StructError::UnknownSfb(index)),
            },
        };
        self.path.pop();
        self.visiting.remove(&key);
        let built = Rc::new(result?);
        self.built.insert(key, Rc::clone(&built));
        Ok(built)
    }

    /// Naturally aligned layout of plain field declarations
    pub fn build_fields(&mut self, fields: &[FieldDecl]) -> Result<Struct, StructError> {
        let mut st = Struct::new();
        for decl in fields {
            self.add_decl(&mut st, decl, false)?;
        }
        Ok(st)
    }

    /// Layout of interface sections. The first field of every section
    /// starts on a word.
    pub fn build_sections(&mut self, sections: &[&[FieldDecl]]) -> Result<Struct, StructError> {
        let mut st = Struct::new();
        for section in sections {
            for (i, decl) in section.iter().enumerate() {
                self.add_decl(&mut st, decl, i == 0)?;
            }
        }
        Ok(st)
    }

    pub fn add_decl(&mut self, st: &mut Struct, decl: &FieldDecl, word_align: bool) -> Result<(), StructError> {
        let init = match &decl.init {
            Some(tokens) => Some(
                decl.data_type
                    .parse_init(tokens)
                    .map_err(|e| StructError::Invalid(e.message()))?,
            ),
            None => None,
        };
        let sub = match &decl.data_type {
            DataType::Udt(index) => Some(self.build_udt(*index)?),
            DataType::FbInstance(index) => {
                let sub = self.build_fb(*index)?;
                if sub.size() == 0 {
                    return Err(StructError::ZeroSizeMultiInstance(decl.name.clone()));
                }
                Some(sub)
            }
            DataType::SfbInstance(index) => Some(self.build_sfb(*index)?),
            DataType::Struct(fields) => Some(Rc::new(self.build_fields(fields)?)),
            _ => None,
        };

        if let Some(sub) = sub {
            let size = sub.size().max(2);
            let size = size + size % 2;
            let parent = st.add_field_aligned(&decl.name, decl.data_type.clone(), size * 8, 2, None)?;
            let base = parent.offset;
            return st.merge_children(&decl.name, base, &sub);
        }

        let bit_size = match &decl.data_type {
            DataType::Array { dims: _, element } => {
                let elem_bits = match element_bit_size(element) {
                    Some(bits) => bits,
                    None => {
                        return Err(StructError::Invalid(format!(
                            "ARRAY '{}' of compound elements is not supported",
                            decl.name
                        )))
                    }
                };
                let count = u64::from(decl.data_type.element_count());
                let bytes = (count * u64::from(elem_bits)).div_ceil(8);
                let bytes = bytes + bytes % 2;
                if bytes > u64::from(MAX_BYTE_OFFSET) + 1 {
                    return Err(StructError::OffsetOverflow(decl.name.clone()));
                }
                (bytes * 8) as u32
            }
            other => other
                .width()
                .ok_or_else(|| StructError::Invalid(format!("Type of '{}' has no size", decl.name)))?,
        };
        let align = if word_align || decl.data_type.is_compound() || bit_size > 8 {
            2
        } else {
            1
        };
        st.add_field_aligned(&decl.name, decl.data_type.clone(), bit_size, align, init)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Types {
        udts: HashMap<u16, Vec<FieldDecl>>,
        fbs: HashMap<u16, Vec<Vec<FieldDecl>>>,
    }

    impl TypeSource for Types {
        fn udt_fields(&self, index: u16) -> Option<&[FieldDecl]> {
            self.udts.get(&index).map(|v| v.as_slice())
        }

        fn fb_sections(&self, index: u16) -> Option<Vec<&[FieldDecl]>> {
            self.fbs
                .get(&index)
                .map(|s| s.iter().map(|v| v.as_slice()).collect())
        }
    }

    #[test]
    fn test_bool_packing_and_alignment() {
        let mut st = Struct::new();
        st.add_field("a", DataType::Bool, 1, None).expect("Should add");
        st.add_field("b", DataType::Bool, 1, None).expect("Should add");
        st.add_field_naturally_aligned("c", DataType::Byte, 8, None).expect("Should add");
        st.add_field_naturally_aligned("d", DataType::Int, 16, None).expect("Should add");

        assert_eq!(st.field("a").map(|f| f.offset), Some(Offset::new(0, 0)));
        assert_eq!(st.field("b").map(|f| f.offset), Some(Offset::new(0, 1)));
        assert_eq!(st.field("c").map(|f| f.offset), Some(Offset::byte(1)));
        assert_eq!(st.field("d").map(|f| f.offset), Some(Offset::byte(2)));
        assert_eq!(st.size(), 4);
    }

    #[test]
    fn test_ninth_bool_starts_new_byte() {
        let mut st = Struct::new();
        for i in 0..9 {
            st.add_field(&format!("b{}", i), DataType::Bool, 1, None).expect("Should add");
        }
        assert_eq!(st.field("b7").map(|f| f.offset), Some(Offset::new(0, 7)));
        assert_eq!(st.field("b8").map(|f| f.offset), Some(Offset::new(1, 0)));
    }

    #[test]
    fn test_duplicate_name_is_ambiguous() {
        let mut st = Struct::new();
        st.add_field("x", DataType::Int, 16, None).expect("Should add");
        let err = st.add_field("x", DataType::Int, 16, None).expect_err("Should fail");
        assert_eq!(err, StructError::Ambiguous("x".to_string()));
    }

    #[test]
    fn test_udt_children_are_flattened() {
        let mut types = Types::default();
        types.udts.insert(
            1,
            vec![FieldDecl::new("flag", DataType::Bool), FieldDecl::new("val", DataType::DInt)],
        );
        let fields = vec![
            FieldDecl::new("x", DataType::Byte),
            FieldDecl::new("rec", DataType::Udt(1)),
        ];
        let mut builder = LayoutBuilder::new(&types);
        let st = builder.build_fields(&fields).expect("Should build");

        assert_eq!(st.field("rec").map(|f| f.offset), Some(Offset::byte(2)));
        assert_eq!(st.field("rec.flag").map(|f| f.offset), Some(Offset::byte(2)));
        assert_eq!(st.field("rec.val").map(|f| f.offset), Some(Offset::byte(4)));
        assert_eq!(st.size(), 8);
    }

    #[test]
    fn test_recursive_udt_is_rejected() {
        let mut types = Types::default();
        types.udts.insert(1, vec![FieldDecl::new("inner", DataType::Udt(2))]);
        types.udts.insert(2, vec![FieldDecl::new("outer", DataType::Udt(1))]);
        let mut builder = LayoutBuilder::new(&types);
        let err = builder.build_udt(1).expect_err("Should detect recursion");
        assert_eq!(err, StructError::Recursion("UDT 1 -> UDT 2 -> UDT 1".to_string()));
    }

    #[test]
    fn test_fb_sections_start_on_words() {
        let mut types = Types::default();
        types.fbs.insert(
            5,
            vec![
                vec![FieldDecl::new("in", DataType::Bool)],
                vec![FieldDecl::new("out", DataType::Bool)],
                vec![],
                vec![FieldDecl::new("count", DataType::Int).with_init(&["7"])],
            ],
        );
        let mut builder = LayoutBuilder::new(&types);
        let st = builder.build_fb(5).expect("Should build");
        assert_eq!(st.field("out").map(|f| f.offset), Some(Offset::byte(2)));
        assert_eq!(st.field("count").map(|f| f.offset), Some(Offset::byte(4)));

        let image = st.init_image().expect("Should build image");
        assert_eq!(image.as_slice(), &[0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn test_empty_multi_instance_is_rejected() {
        let mut types = Types::default();
        types.fbs.insert(2, vec![vec![], vec![], vec![], vec![]]);
        let fields = vec![FieldDecl::new("inst", DataType::FbInstance(2))];
        let mut builder = LayoutBuilder::new(&types);
        let err = builder.build_fields(&fields).expect_err("Should fail");
        assert_eq!(err, StructError::ZeroSizeMultiInstance("inst".to_string()));
    }

    #[test]
    fn test_sfb_multi_instance_layout() {
        let types = Types::default();
        let fields = vec![
            FieldDecl::new("flag", DataType::Bool),
            FieldDecl::new("count", DataType::SfbInstance(0)),
        ];
        let mut builder = LayoutBuilder::new(&types);
        let st = builder.build_fields(&fields).expect("Should build");
        // CTU instance data is 9 bytes, padded to 10
        assert_eq!(st.field("count.PV").map(|f| f.offset), Some(Offset::byte(4)));
        assert_eq!(st.size(), 12);

        let fields = vec![FieldDecl::new("bad", DataType::SfbInstance(77))];
        let err = builder.build_fields(&fields).expect_err("Should fail");
        assert_eq!(err, StructError::UnknownSfb(77));
    }

    #[test]
    fn test_array_elements() {
        let types = Types::default();
        let fields = vec![
            FieldDecl::new("flags", DataType::parse("ARRAY [0..9] OF BOOL").expect("Should parse")),
            FieldDecl::new("vals", DataType::parse("ARRAY [1..3] OF INT").expect("Should parse")),
        ];
        let mut builder = LayoutBuilder::new(&types);
        let st = builder.build_fields(&fields).expect("Should build");

        let (off, bits, _) = st.array_element("flags", &[9]).expect("Should index");
        assert_eq!((off, bits), (Offset::new(1, 1), 1));
        let (off, bits, dt) = st.array_element("vals", &[3]).expect("Should index");
        assert_eq!((off, bits, dt), (Offset::byte(6), 16, DataType::Int));
        assert!(st.array_element("vals", &[4]).is_err());
    }

    #[test]
    fn test_fields_past_the_byte_offset_limit_are_rejected() {
        let types = Types::default();
        let mut builder = LayoutBuilder::new(&types);

        let fields = vec![FieldDecl::new(
            "big",
            DataType::parse("ARRAY [1..40000] OF DWORD").expect("Should parse"),
        )];
        let err = builder.build_fields(&fields).expect_err("Should reject the ARRAY");
        assert_eq!(err, StructError::OffsetOverflow("big".to_string()));

        // 64 KiB exactly still fits, one more byte does not
        let fields = vec![
            FieldDecl::new("fill", DataType::parse("ARRAY [0..65533] OF BYTE").expect("Should parse")),
            FieldDecl::new("last", DataType::Word),
        ];
        let st = builder.build_fields(&fields).expect("Should build");
        assert_eq!(st.size(), 0x10000);
        assert_eq!(st.field("last").map(|f| f.offset), Some(Offset::byte(0xFFFE)));

        let fields = vec![
            FieldDecl::new("fill", DataType::parse("ARRAY [0..65535] OF BYTE").expect("Should parse")),
            FieldDecl::new("tail", DataType::Byte),
        ];
        let err = builder.build_fields(&fields).expect_err("Should reject the tail");
        assert_eq!(err, StructError::OffsetOverflow("tail".to_string()));
    }
}
