//! Memory layout computation.

mod common;

use common::load;
use dfmem::abi::Abi;
use dfmem::layout::LayoutError;
use dfmem::path::parse;
use dfmem::schema::PrimitiveKind;
use dfmem::{MemoryLayout, Structures, TypeInfo};

fn unit_schema() -> Structures {
    load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="unit">
                <int32_t name="id"/>
                <stl-string name="name"/>
                <stl-vector name="friends" pointer-type="unit"/>
            </struct-type>
        </data-definition>"#,
    )])
}

#[test]
fn unit_layout_under_gcc_cxx11_64() {
    let structures = unit_schema();
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let unit = structures.find_compound("unit").unwrap();
    assert_eq!(layout.type_info(unit), Some(TypeInfo::new(64, 8)));
    let compound = layout.compound(unit).unwrap();
    assert_eq!(compound.member_offsets, vec![0, 8, 40]);
    assert_eq!(compound.unaligned_size, 64);
}

#[test]
fn layout_is_deterministic() {
    let structures = unit_schema();
    let first = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let second = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let unit = structures.find_compound("unit").unwrap();
    assert_eq!(first.type_info(unit), second.type_info(unit));
    assert_eq!(first.compound(unit), second.compound(unit));
    for id in structures.all_primitives() {
        assert_eq!(first.type_info(id), second.type_info(id));
    }
}

#[test]
fn class_inheritance_with_vtable() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <class-type type-name="base_a">
                <int32_t name="a"/>
            </class-type>
            <class-type type-name="derived_b" inherits-from="base_a">
                <int32_t name="b"/>
            </class-type>
        </data-definition>"#,
    )]);

    // GNU: the child packs into the parent's tail padding.
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let a = structures.find_compound("base_a").unwrap();
    let b = structures.find_compound("derived_b").unwrap();
    assert_eq!(layout.type_info(a), Some(TypeInfo::new(16, 8)));
    assert_eq!(layout.compound(a).unwrap().member_offsets, vec![8]);
    assert_eq!(layout.compound(a).unwrap().unaligned_size, 12);
    assert_eq!(layout.type_info(b), Some(TypeInfo::new(16, 8)));
    assert_eq!(layout.compound(b).unwrap().member_offsets, vec![12]);

    // MSVC: the child starts at the parent's padded size.
    let layout = MemoryLayout::new(&structures, &Abi::MSVC2015_64).unwrap();
    assert_eq!(layout.type_info(a), Some(TypeInfo::new(16, 8)));
    assert_eq!(layout.compound(a).unwrap().member_offsets, vec![8]);
    assert_eq!(layout.compound(b).unwrap().member_offsets, vec![16]);
    assert_eq!(layout.type_info(b), Some(TypeInfo::new(24, 8)));
}

#[test]
fn gnu_tail_packing_vs_msvc() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="parent_t">
                <int64_t name="x"/>
                <int8_t name="y"/>
            </struct-type>
            <struct-type type-name="child_t" inherits-from="parent_t">
                <int8_t name="z"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let parent = structures.find_compound("parent_t").unwrap();
    let child = structures.find_compound("child_t").unwrap();

    let gnu = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    assert_eq!(gnu.type_info(parent), Some(TypeInfo::new(16, 8)));
    assert_eq!(gnu.compound(parent).unwrap().unaligned_size, 9);
    assert_eq!(gnu.compound(child).unwrap().member_offsets, vec![9]);
    assert_eq!(gnu.type_info(child), Some(TypeInfo::new(16, 8)));

    let msvc = MemoryLayout::new(&structures, &Abi::MSVC2015_64).unwrap();
    assert_eq!(msvc.compound(child).unwrap().member_offsets, vec![16]);
    assert_eq!(msvc.type_info(child), Some(TypeInfo::new(24, 8)));
}

#[test]
fn union_layout() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="target" is-union="true">
                <int32_t name="histfig"/>
                <int8_t name="topic"/>
                <int16_t name="half"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let target = structures.find_compound("target").unwrap();
    let compound = layout.compound(target).unwrap();
    assert_eq!(compound.member_offsets, vec![0, 0, 0]);
    assert_eq!(compound.unaligned_size, 4);
    assert_eq!(layout.type_info(target), Some(TypeInfo::new(4, 4)));
}

#[test]
fn member_offsets_are_monotonic_and_aligned() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="mixed">
                <int8_t name="a"/>
                <int32_t name="b"/>
                <int8_t name="c"/>
                <int64_t name="d"/>
                <int16_t name="e"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let id = structures.find_compound("mixed").unwrap();
    let compound = structures.compound(id).unwrap();
    let info = layout.compound(id).unwrap();

    let mut previous_end = 0;
    for (member, &offset) in compound.members.iter().zip(&info.member_offsets) {
        let member_info = layout.type_info(member.ty.id().unwrap()).unwrap();
        assert!(offset >= previous_end, "offsets must not overlap");
        assert_eq!(offset % member_info.align, 0, "member must be aligned");
        previous_end = offset + member_info.size;
    }
    assert_eq!(info.member_offsets, vec![0, 4, 8, 16, 24]);
    assert_eq!(layout.type_info(id), Some(TypeInfo::new(32, 8)));
}

#[test]
fn cyclic_dependency_is_an_error() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="ouro">
                <compound name="tail" type-name="boros"/>
            </struct-type>
            <struct-type type-name="boros">
                <compound name="head" type-name="ouro"/>
            </struct-type>
        </data-definition>"#,
    )]);
    assert!(matches!(
        MemoryLayout::new(&structures, &Abi::GCC_CXX11_64),
        Err(LayoutError::CyclicDependency(_))
    ));
}

#[test]
fn pointers_break_layout_cycles() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="node">
                <int32_t name="value"/>
                <pointer name="next" type-name="node"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let node = structures.find_compound("node").unwrap();
    assert_eq!(layout.type_info(node), Some(TypeInfo::new(16, 8)));
}

#[test]
fn dependent_containers_need_complete_parameters() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="holder">
                <stl-optional name="maybe" type-name="int32_t"/>
                <stl-vector name="many" type-name="int64_t"/>
                <stl-deque name="queue" type-name="int32_t"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let id = structures.find_compound("holder").unwrap();
    let info = layout.compound(id).unwrap();
    // optional<int32> is {align + size} = 8, vector 24, deque 80.
    assert_eq!(info.member_offsets, vec![0, 8, 32]);
    assert_eq!(layout.type_info(id), Some(TypeInfo::new(112, 8)));
}

#[test]
fn static_array_extent_from_index_enum() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <enum-type type-name="material_flags" base-type="uint8_t">
                <enum-item name="X" value="0"/>
                <enum-item name="Y" value="2"/>
                <enum-item name="Z" value="5"/>
            </enum-type>
            <struct-type type-name="mat_table">
                <static-array name="by_flag" type-name="int64_t" index-enum="material_flags"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let id = structures.find_compound("mat_table").unwrap();
    // Extent = enum count = 6.
    assert_eq!(layout.type_info(id), Some(TypeInfo::new(48, 8)));

    let (ty, offset) = layout
        .offset_of(&structures, id, &parse("by_flag[Z]").unwrap())
        .unwrap();
    assert_eq!(offset, 40);
    assert_eq!(ty, structures.primitive_id(PrimitiveKind::Int64));

    assert!(matches!(
        layout.offset_of(&structures, id, &parse("by_flag[MISSING]").unwrap()),
        Err(LayoutError::InvalidIndex(_))
    ));
}

#[test]
fn offset_queries_through_anonymous_members() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="holder">
                <int32_t name="x"/>
                <compound>
                    <int16_t name="inner_a"/>
                    <compound>
                        <int8_t name="deep"/>
                    </compound>
                </compound>
                <int32_t name="y"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let holder = structures.find_compound("holder").unwrap();

    let (ty, offset) = layout
        .offset_of(&structures, holder, &parse("deep").unwrap())
        .unwrap();
    assert_eq!(offset, 6);
    assert_eq!(ty, structures.primitive_id(PrimitiveKind::Int8));

    // container_of accounts only the outermost anonymous member.
    let (_, offset) = layout
        .offset_of(&structures, holder, &parse("(deep)").unwrap())
        .unwrap();
    assert_eq!(offset, 4);

    let (_, offset) = layout
        .offset_of(&structures, holder, &parse("y").unwrap())
        .unwrap();
    assert_eq!(offset, 8);
}

#[test]
fn index_requires_a_static_array() {
    let structures = unit_schema();
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let unit = structures.find_compound("unit").unwrap();

    // Indexing a vector member is not a static offset.
    assert!(matches!(
        layout.offset_of(&structures, unit, &parse("friends[0]").unwrap()),
        Err(LayoutError::NeedsStaticArray)
    ));
    // Indexing a non-container at all.
    assert!(matches!(
        layout.offset_of(&structures, unit, &parse("id[0]").unwrap()),
        Err(LayoutError::NeedsContainer)
    ));
}

#[test]
fn df_containers_take_their_compound_layout() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="unit">
                <df-flagarray name="flags"/>
                <df-array name="scores" type-name="int16_t"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let layout = MemoryLayout::new(&structures, &Abi::GCC_CXX11_64).unwrap();
    let unit = structures.find_compound("unit").unwrap();
    let info = layout.compound(unit).unwrap();
    // flag array {u8* bits, u32 size} -> 16; df array {T* data, u16 size} -> 16.
    assert_eq!(info.member_offsets, vec![0, 16]);
    assert_eq!(layout.type_info(unit), Some(TypeInfo::new(32, 8)));
}
