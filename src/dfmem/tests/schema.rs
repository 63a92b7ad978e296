//! Schema import and resolution.

mod common;

use common::{load, write_structures};
use dfmem::schema::{AttributeValue, DfKind, PrimitiveKind, Type};
use dfmem::{SchemaError, Structures};

#[test]
fn enum_values_and_count() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <enum-type type-name="material_flags" base-type="uint8_t">
                <enum-item name="X" value="0"/>
                <enum-item name="Y" value="2"/>
                <enum-item name="Z" value="5"/>
            </enum-type>
        </data-definition>"#,
    )]);
    let id = structures.find_enum("material_flags").unwrap();
    let Type::Enum(e) = structures.get(id) else {
        panic!("not an enum");
    };
    assert_eq!(e.base, PrimitiveKind::UInt8);
    assert_eq!(e.count, 6);
    assert_eq!(e.value("Y"), Some(2));
    assert_eq!(e.name_of(5), Some("Z"));
    assert_eq!(e.name_of(1), None);
}

#[test]
fn enum_attributes_with_types_and_defaults() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <enum-type type-name="color" base-type="int32_t">
                <enum-item name="RED"/>
                <enum-item name="BLUE"/>
            </enum-type>
            <enum-type type-name="gem" base-type="int32_t">
                <enum-attr name="value" type-name="int32_t" default-value="10"/>
                <enum-attr name="color" type-name="color" default-value="RED"/>
                <enum-attr name="tag"/>
                <enum-item name="RUBY">
                    <item-attr name="value" value="100"/>
                </enum-item>
                <enum-item name="SAPPHIRE">
                    <item-attr name="color" value="BLUE"/>
                    <item-attr name="tag" value="shiny"/>
                </enum-item>
            </enum-type>
        </data-definition>"#,
    )]);
    let id = structures.find_enum("gem").unwrap();
    let Type::Enum(e) = structures.get(id) else {
        panic!("not an enum");
    };
    assert_eq!(e.attribute("RUBY", "value"), Some(&AttributeValue::Int(100)));
    assert_eq!(
        e.attribute("SAPPHIRE", "value"),
        Some(&AttributeValue::Int(10))
    );
    assert_eq!(
        e.attribute("RUBY", "color"),
        Some(&AttributeValue::EnumValue {
            name: "RED".to_owned(),
            value: 0,
        })
    );
    assert_eq!(
        e.attribute("SAPPHIRE", "color"),
        Some(&AttributeValue::EnumValue {
            name: "BLUE".to_owned(),
            value: 1,
        })
    );
    // Untyped attributes stay raw strings.
    assert_eq!(
        e.attribute("SAPPHIRE", "tag"),
        Some(&AttributeValue::Str("shiny".to_owned()))
    );
    assert_eq!(e.attribute("RUBY", "tag"), None);
}

#[test]
fn bitfield_offsets() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <bitfield-type type-name="cflags">
                <flag-bit name="a"/>
                <flag-bit name="b" count="3"/>
                <flag-bit name="c"/>
            </bitfield-type>
        </data-definition>"#,
    )]);
    let id = structures.find_bitfield("cflags").unwrap();
    let Type::Bitfield(b) = structures.get(id) else {
        panic!("not a bitfield");
    };
    assert_eq!(b.base, PrimitiveKind::UInt32);
    let offsets: Vec<(u32, u32)> = b.flags.iter().map(|f| (f.offset, f.count)).collect();
    assert_eq!(offsets, vec![(0, 1), (1, 3), (4, 1)]);
    assert_eq!(b.flag("b").map(|f| f.offset), Some(1));
}

#[test]
fn duplicate_type_fails_load() {
    let dir = write_structures(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="unit"><int32_t name="id"/></struct-type>
            <struct-type type-name="unit"><int32_t name="id"/></struct-type>
        </data-definition>"#,
    )]);
    assert!(matches!(
        Structures::load(dir.path()),
        Err(SchemaError::LoadFailed { errors: 1 })
    ));
}

#[test]
fn unknown_tags_are_collected_not_fatal_per_file() {
    let dir = write_structures(&[(
        "df.test.xml",
        r#"<data-definition>
            <widget-type type-name="nope"/>
            <struct-type type-name="unit"><int32_t name="id"/></struct-type>
            <struct-type type-name="bad"><warbler name="x"/></struct-type>
        </data-definition>"#,
    )]);
    // Both problems are reported; the valid type was still parsed before
    // the constructor failed.
    assert!(matches!(
        Structures::load(dir.path()),
        Err(SchemaError::LoadFailed { errors: 2 })
    ));
}

#[test]
fn unresolved_reference_fails_load() {
    let dir = write_structures(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="unit">
                <compound name="soul" type-name="unit_soul"/>
            </struct-type>
        </data-definition>"#,
    )]);
    assert!(matches!(
        Structures::load(dir.path()),
        Err(SchemaError::LoadFailed { .. })
    ));
}

#[test]
fn members_parse_into_expected_types() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="unit">
                <int32_t name="id"/>
                <stl-string name="name"/>
                <stl-vector name="friends" pointer-type="unit" has-bad-pointers="true"/>
                <static-string name="tag" size="8"/>
                <padding name="gap" size="12" align="4"/>
                <pointer name="rival" type-name="unit"/>
                <df-flagarray name="flags"/>
            </struct-type>
        </data-definition>"#,
    )]);
    let id = structures.find_compound("unit").unwrap();
    let unit = structures.compound(id).unwrap();
    assert_eq!(unit.members.len(), 7);

    let friends = unit.members[2].ty.id().unwrap();
    let Type::Std(vector) = structures.get(friends) else {
        panic!("friends is not an stl container");
    };
    assert!(vector.has_bad_pointers);
    let item = vector.params[0].id().unwrap();
    let Type::Pointer(pointer) = structures.get(item) else {
        panic!("vector item is not a pointer");
    };
    assert!(pointer.has_bad_pointers);
    assert_eq!(
        pointer.item.as_ref().and_then(|slot| slot.id()),
        Some(id),
        "pointer-type recursion must point back at unit"
    );

    let tag = unit.members[3].ty.id().unwrap();
    let Type::StaticArray(array) = structures.get(tag) else {
        panic!("static-string is not an array");
    };
    assert_eq!(array.extent, Some(8));
    assert_eq!(
        array.item.id(),
        Some(structures.primitive_id(PrimitiveKind::Char))
    );

    let gap = unit.members[4].ty.id().unwrap();
    let Type::Padding(padding) = structures.get(gap) else {
        panic!("padding member");
    };
    assert_eq!((padding.size, padding.align), (12, 4));

    let flags = unit.members[6].ty.id().unwrap();
    let Type::Df(flag_array) = structures.get(flags) else {
        panic!("df-flagarray member");
    };
    assert_eq!(flag_array.kind, DfKind::FlagArray);
    let node = structures.compound(flag_array.compound).unwrap();
    assert_eq!(node.members.len(), 2);
    assert_eq!(node.members[0].name, "bits");
    assert_eq!(node.members[1].name, "size");
}

#[test]
fn linked_list_nodes_are_self_referential() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="job"><int32_t name="id"/></struct-type>
            <df-linked-list-type type-name="job_list_link" item-type="job"/>
        </data-definition>"#,
    )]);
    let list = structures.find_linked_list("job_list_link").unwrap();
    let Type::Df(container) = structures.get(list) else {
        panic!("not a df container");
    };
    assert_eq!(container.kind, DfKind::LinkedList);
    let node = structures.compound(container.compound).unwrap();
    assert_eq!(node.members.len(), 3);

    let item_ptr = node.members[0].ty.id().unwrap();
    let Type::Pointer(item) = structures.get(item_ptr) else {
        panic!("item is not a pointer");
    };
    assert_eq!(
        item.item.as_ref().and_then(|slot| slot.id()),
        structures.find_compound("job")
    );

    for index in [1, 2] {
        let ptr = node.members[index].ty.id().unwrap();
        let Type::Pointer(link) = structures.get(ptr) else {
            panic!("prev/next is not a pointer");
        };
        assert_eq!(
            link.item.as_ref().and_then(|slot| slot.id()),
            Some(list),
            "prev/next must resolve to the node type itself"
        );
    }
}

#[test]
fn other_vectors_members_follow_the_index_enum() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="unit"><int32_t name="id"/></struct-type>
            <enum-type type-name="units_other_id" base-type="int32_t">
                <enum-item name="ANY"/>
                <enum-item name="ACTIVE"/>
                <enum-item name="DEAD"/>
            </enum-type>
            <df-other-vectors-type type-name="units_other"
                    index-enum="units_other_id" item-type="unit">
                <stl-vector name="ACTIVE" pointer-type="unit"/>
            </df-other-vectors-type>
        </data-definition>"#,
    )]);
    let id = structures.find_compound("units_other").unwrap();
    let compound = structures.compound(id).unwrap();
    let names: Vec<&str> = compound.members.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["ANY", "ACTIVE", "DEAD"]);
    for member in &compound.members {
        let Type::Std(vector) = structures.get(member.ty.id().unwrap()) else {
            panic!("other-vectors member is not a vector");
        };
        let Type::Pointer(pointer) = structures.get(vector.params[0].id().unwrap()) else {
            panic!("other-vectors item is not a pointer");
        };
        assert_eq!(
            pointer.item.as_ref().and_then(|slot| slot.id()),
            structures.find_compound("unit")
        );
    }
}

#[test]
fn search_member_descends_anonymous_compounds() {
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
    let holder = structures.find_compound("holder").unwrap();

    let path = structures.search_member(holder, "deep");
    assert_eq!(path.len(), 3);
    assert_eq!(path[0].0, holder);
    assert_eq!(path[0].1, 1);

    let direct = structures.search_member(holder, "y");
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0], (holder, 2));

    assert!(structures.search_member(holder, "nothing").is_empty());
}

#[test]
fn globals_and_versions() {
    let structures = load(&[
        (
            "df.test.xml",
            r#"<data-definition>
                <struct-type type-name="world"><int32_t name="tick"/></struct-type>
                <global-object name="world" type-name="world"/>
                <global-object name="flags">
                    <int32_t name="a"/>
                    <int32_t name="b"/>
                </global-object>
            </data-definition>"#,
        ),
        (
            "symbols.xml",
            r#"<data-definition>
                <symbol-table name="v0.47.05 linux64">
                    <md5-hash value="00112233445566778899aabbccddeeff"/>
                    <global-address name="world" value="0x1000"/>
                </symbol-table>
                <symbol-table name="v0.47.05 win64">
                    <binary-timestamp value="0x5F8E3D2A"/>
                    <global-address name="world" value="4096"/>
                    <vtable-address name="itemdefst" value="0x2000"/>
                </symbol-table>
            </data-definition>"#,
        ),
    ]);

    assert_eq!(
        structures.find_global_type("world"),
        structures.find_compound("world")
    );
    // An inline global gets an anonymous compound type.
    let flags = structures.find_global_type("flags").unwrap();
    assert_eq!(structures.compound(flags).map(|c| c.members.len()), Some(2));

    assert_eq!(structures.versions().len(), 2);
    let linux = structures.version_by_name("v0.47.05 linux64").unwrap();
    assert_eq!(linux.id.len(), 16);
    assert_eq!(linux.id[0], 0x00);
    assert_eq!(linux.id[15], 0xff);
    assert_eq!(linux.global_addresses.get("world"), Some(&0x1000));

    let win = structures.version_by_name("v0.47.05 win64").unwrap();
    assert_eq!(win.id, vec![0x5f, 0x8e, 0x3d, 0x2a]);
    assert_eq!(win.global_addresses.get("world"), Some(&4096));
    assert_eq!(win.vtable_addresses.get("itemdefst"), Some(&0x2000));

    assert!(structures.version_by_id(&[0x5f, 0x8e, 0x3d, 0x2a]).is_some());
    assert!(structures.version_by_id(&[1, 2, 3, 4]).is_none());
}

#[test]
fn find_child_type_walks_members_and_containers() {
    let structures = load(&[(
        "df.test.xml",
        r#"<data-definition>
            <struct-type type-name="plant_raw">
                <stl-string name="name"/>
            </struct-type>
            <struct-type type-name="raws">
                <stl-vector name="plants" pointer-type="plant_raw"/>
            </struct-type>
            <struct-type type-name="world">
                <compound name="raws" type-name="raws"/>
            </struct-type>
            <global-object name="world" type-name="world"/>
        </data-definition>"#,
    )]);
    let path = dfmem::path::parse("world.raws.plants[3].name").unwrap();
    let ty = structures.global_type(&path).unwrap();
    assert_eq!(
        ty,
        structures.primitive_id(PrimitiveKind::StdString),
        "the path resolves to the plant name string"
    );

    let missing = dfmem::path::parse("world.raws.nothing").unwrap();
    assert!(matches!(
        structures.global_type(&missing),
        Err(SchemaError::MemberNotFound(name)) if name == "nothing"
    ));
}
