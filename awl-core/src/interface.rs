//! Block interfaces (IN/OUT/INOUT/STAT/TEMP) and `#name` binding

use crate::constants::OB_STARTUP_TEMP_ALLOCATION;
use crate::datatypes::{DataType, FieldDecl};
use crate::offset::Offset;
use crate::operand::LocalBinding;
use crate::raw::{RawField, Section};
use crate::structure::{LayoutBuilder, Struct, StructError, TypeKey, TypeSource};
use awl_common::{AwlError, AwlResult, BlockKind};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceField {
    pub name: String,
    pub section: Section,
    pub data_type: DataType,
    /// Layout of a compound parameter (the field itself at offset 0 plus
    /// its flattened members)
    pub layout: Option<Rc<Struct>>,
}

impl InterfaceField {
    pub fn is_inbound(&self) -> bool {
        matches!(self.section, Section::In | Section::InOut)
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self.section, Section::Out | Section::InOut)
    }

    /// Compound IN_OUT of an FB, stored as a DB pointer
    pub fn is_fb_pointer_param(&self, kind: BlockKind) -> bool {
        kind == BlockKind::Fb && self.section == Section::InOut && self.data_type.is_compound()
    }
}

/// How a `#name` reference resolved against an interface
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub binding: LocalBinding,
    pub width: u32,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockInterface {
    pub kind: BlockKind,
    /// Declared fields in IN, OUT, INOUT, STAT, TEMP order
    pub fields: Vec<InterfaceField>,
    /// IN/OUT/INOUT/STAT of an FB
    pub instance_struct: Option<Rc<Struct>>,
    pub temp_struct: Struct,
    /// Bytes of local stack a call reserves
    pub temp_allocation: u32,
}

const SECTION_ORDER: [Section; 5] = [Section::In, Section::Out, Section::InOut, Section::Stat, Section::Temp];

/// Field declarations of an FB as they appear in its instance struct.
/// Compound IN_OUT parameters become 48-bit DB pointers.
pub fn fb_instance_sections(fields: &[RawField]) -> AwlResult<Vec<Vec<FieldDecl>>> {
    let mut sections = vec![Vec::new(), Vec::new(), Vec::new(), Vec::new()];
    for (slot, section) in SECTION_ORDER[..4].iter().enumerate() {
        for field in fields.iter().filter(|f| f.section == *section) {
            let data_type = DataType::parse(&field.data_type)?;
            let data_type = if *section == Section::InOut && data_type.is_compound() {
                DataType::Pointer
            } else {
                data_type
            };
            sections[slot].push(FieldDecl {
                name: field.name.clone(),
                data_type,
                init: field.init.clone(),
            });
        }
    }
    Ok(sections)
}

impl BlockInterface {
    pub fn build<S: TypeSource>(
        kind: BlockKind,
        index: u16,
        raw: &[RawField],
        builder: &mut LayoutBuilder<'_, S>,
    ) -> AwlResult<Self> {
        let instance = (kind == BlockKind::Fb).then_some(TypeKey::Fb(index));
        Self::build_with_instance(kind, index, raw, instance, builder)
    }

    /// Build with the instance layout taken from `instance`
    pub fn build_with_instance<S: TypeSource>(
        kind: BlockKind,
        index: u16,
        raw: &[RawField],
        instance: Option<TypeKey>,
        builder: &mut LayoutBuilder<'_, S>,
    ) -> AwlResult<Self> {
        for field in raw {
            let allowed = match kind {
                BlockKind::Ob => field.section == Section::Temp,
                BlockKind::Fc => field.section != Section::Stat,
                _ => true,
            };
            if !allowed {
                return Err(AwlError::compile(format!(
                    "{} {} cannot have {} field '{}'",
                    kind, index, field.section, field.name
                )));
            }
            if raw.iter().filter(|f| f.name == field.name).count() > 1 {
                return Err(StructError::Ambiguous(field.name.clone()).into());
            }
        }

        let mut fields = Vec::new();
        for section in SECTION_ORDER {
            for raw_field in raw.iter().filter(|f| f.section == section) {
                let data_type = DataType::parse(&raw_field.data_type)?;
                let layout = if data_type.is_compound() && section != Section::Stat && section != Section::Temp {
                    let decl = FieldDecl::new(&raw_field.name, data_type.clone());
                    Some(Rc::new(builder.build_fields(std::slice::from_ref(&decl))?))
                } else {
                    None
                };
                fields.push(InterfaceField {
                    name: raw_field.name.clone(),
                    section,
                    data_type,
                    layout,
                });
            }
        }

        let instance_struct = match instance {
            Some(key) => Some(builder.build_type(key)?),
            None => None,
        };

        let temp_decls: Vec<FieldDecl> = raw
            .iter()
            .filter(|f| f.section == Section::Temp)
            .map(|f| -> AwlResult<FieldDecl> {
                Ok(FieldDecl::new(&f.name, DataType::parse(&f.data_type)?))
            })
            .collect::<AwlResult<_>>()?;
        let temp_struct = builder.build_fields(&temp_decls)?;
        let mut temp_allocation = temp_struct.size();
        if kind == BlockKind::Ob {
            temp_allocation = temp_allocation.max(OB_STARTUP_TEMP_ALLOCATION);
        }

        Ok(Self {
            kind,
            fields,
            instance_struct,
            temp_struct,
            temp_allocation,
        })
    }

    pub fn field(&self, name: &str) -> Option<(usize, &InterfaceField)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == name)
    }

    /// Parameters (IN, OUT, INOUT) in declaration order
    pub fn params(&self) -> impl Iterator<Item = (usize, &InterfaceField)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| matches!(f.section, Section::In | Section::Out | Section::InOut))
    }

    /// Size of an FB's instance data in bytes
    pub fn instance_size(&self) -> u32 {
        self.instance_struct.as_ref().map_or(0, |s| s.size())
    }

    /// Resolve `#name` (optionally with ARRAY subscripts) to a binding
    pub fn bind(&self, name: &str, indices: &[i32]) -> AwlResult<Binding> {
        let root = name.split('.').next().unwrap_or(name);
        let (index, field) = self
            .field(root)
            .ok_or_else(|| AwlError::compile(format!("Local symbol '#{}' not found in block interface", name)))?;

        if field.section == Section::Temp {
            let (offset, width, data_type) = lookup(&self.temp_struct, name, indices)?;
            return Ok(Binding {
                binding: LocalBinding::Temp { offset },
                width,
                data_type,
            });
        }

        match self.kind {
            BlockKind::Fb => {
                let inst = self
                    .instance_struct
                    .as_ref()
                    .ok_or_else(|| AwlError::bug("FB without instance struct"))?;
                if field.is_fb_pointer_param(self.kind) {
                    let layout = field
                        .layout
                        .as_ref()
                        .ok_or_else(|| AwlError::bug("Compound parameter without layout"))?;
                    let (sub_offset, width, data_type) = lookup(layout, name, indices)?;
                    let offset = inst
                        .field(root)
                        .map(|f| f.offset)
                        .ok_or_else(|| AwlError::bug(format!("Parameter '{}' missing in instance", root)))?;
                    return Ok(Binding {
                        binding: LocalBinding::InstancePointer { offset, sub_offset },
                        width,
                        data_type,
                    });
                }
                let (offset, width, data_type) = lookup(inst, name, indices)?;
                Ok(Binding {
                    binding: LocalBinding::Instance { offset },
                    width,
                    data_type,
                })
            }
            BlockKind::Fc => {
                let (sub_offset, width, data_type) = match &field.layout {
                    Some(layout) => lookup(layout, name, indices)?,
                    None if name == root && indices.is_empty() => {
                        let width = field.data_type.width().unwrap_or(0);
                        (Offset::default(), width, field.data_type.clone())
                    }
                    None => {
                        return Err(AwlError::compile(format!(
                            "Parameter '#{}' has no member '{}'",
                            root, name
                        )))
                    }
                };
                Ok(Binding {
                    binding: LocalBinding::FcParam { index, sub_offset },
                    width,
                    data_type,
                })
            }
            _ => Err(AwlError::compile(format!(
                "Local symbol '#{}' is not accessible in an OB",
                name
            ))),
        }
    }
}

fn lookup(st: &Struct, name: &str, indices: &[i32]) -> AwlResult<(Offset, u32, DataType)> {
    if !indices.is_empty() {
        return st.array_element(name, indices);
    }
    let field = st
        .field(name)
        .ok_or_else(|| AwlError::compile(format!("Local symbol '#{}' not found in block interface", name)))?;
    Ok((field.offset, field.bit_size, field.data_type.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct Fbs(HashMap<u16, Vec<Vec<FieldDecl>>>);

    impl TypeSource for Fbs {
        fn udt_fields(&self, _index: u16) -> Option<&[FieldDecl]> {
            None
        }

        fn fb_sections(&self, index: u16) -> Option<Vec<&[FieldDecl]>> {
            self.0.get(&index).map(|s| s.iter().map(|v| v.as_slice()).collect())
        }
    }

    fn raw(fields: &[(&str, Section, &str)]) -> Vec<RawField> {
        fields.iter().map(|(n, s, t)| RawField::new(n, *s, t)).collect()
    }

    #[test]
    fn test_fb_binding() {
        let fields = raw(&[
            ("x", Section::In, "INT"),
            ("y", Section::Out, "INT"),
            ("tmp", Section::Temp, "DINT"),
        ]);
        let types = Fbs(HashMap::from([(1, fb_instance_sections(&fields).expect("Should split"))]));
        let mut builder = LayoutBuilder::new(&types);
        let iface = BlockInterface::build(BlockKind::Fb, 1, &fields, &mut builder).expect("Should build");

        assert_eq!(iface.instance_size(), 4);
        let y = iface.bind("y", &[]).expect("Should bind");
        assert_eq!(y.binding, LocalBinding::Instance { offset: Offset::byte(2) });
        assert_eq!(y.width, 16);
        let tmp = iface.bind("tmp", &[]).expect("Should bind");
        assert_eq!(tmp.binding, LocalBinding::Temp { offset: Offset::byte(0) });
        assert!(iface.bind("nope", &[]).is_err());
    }

    #[test]
    fn test_fc_binding_uses_param_index() {
        let fields = raw(&[
            ("a", Section::In, "INT"),
            ("t", Section::Temp, "INT"),
            ("b", Section::Out, "INT"),
        ]);
        let types = Fbs(HashMap::new());
        let mut builder = LayoutBuilder::new(&types);
        let iface = BlockInterface::build(BlockKind::Fc, 1, &fields, &mut builder).expect("Should build");

        // Fields are ordered by section: a, b, t
        let b = iface.bind("b", &[]).expect("Should bind");
        assert_eq!(b.binding, LocalBinding::FcParam { index: 1, sub_offset: Offset::default() });
        assert_eq!(iface.params().count(), 2);
    }

    #[test]
    fn test_section_rules() {
        let types = Fbs(HashMap::new());
        let mut builder = LayoutBuilder::new(&types);
        let ob = raw(&[("x", Section::In, "INT")]);
        assert!(BlockInterface::build(BlockKind::Ob, 1, &ob, &mut builder).is_err());
        let fc = raw(&[("s", Section::Stat, "INT")]);
        assert!(BlockInterface::build(BlockKind::Fc, 1, &fc, &mut builder).is_err());
        let dup = raw(&[("a", Section::In, "INT"), ("a", Section::Temp, "INT")]);
        let err = BlockInterface::build(BlockKind::Fc, 2, &dup, &mut builder).expect_err("Should fail");
        assert_eq!(err.message(), "Ambiguous field name 'a'");
    }

    #[test]
    fn test_ob_temp_allocation_minimum() {
        let types = Fbs(HashMap::new());
        let mut builder = LayoutBuilder::new(&types);
        let ob = raw(&[("x", Section::Temp, "INT")]);
        let iface = BlockInterface::build(BlockKind::Ob, 1, &ob, &mut builder).expect("Should build");
        assert_eq!(iface.temp_allocation, 20);
    }
}
